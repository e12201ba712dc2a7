//! Fit per-tag baselines from historical readings.
//!
//! Input is a CSV file with `tag_id` and `value` columns (other columns are
//! ignored); output is the JSON model loaded by `kora-engine --model`.

use kora_core::anomaly::{BaselineModel, DEFAULT_Z_THRESHOLD};
use kora_core::error::ModelError;
use kora_core::tags::TagId;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;

#[derive(Debug, Deserialize)]
struct Row {
    tag_id: String,
    value: f64,
}

#[derive(Debug, Error)]
enum TrainError {
    #[error("{0}")]
    Usage(String),

    #[error("failed to read {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("no tag had enough samples to fit a baseline")]
    NothingFitted,

    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug)]
struct TrainArgs {
    input: PathBuf,
    output: PathBuf,
    z_threshold: f64,
}

fn parse_args(args: &[String]) -> Result<Option<TrainArgs>, TrainError> {
    let mut input = None;
    let mut output = None;
    let mut z_threshold = DEFAULT_Z_THRESHOLD;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        if matches!(flag, "-h" | "--help") {
            return Ok(None);
        }
        let value = args
            .get(i + 1)
            .ok_or_else(|| TrainError::Usage(format!("{flag} requires a value")))?;
        match flag {
            "--input" => input = Some(PathBuf::from(value)),
            "--output" => output = Some(PathBuf::from(value)),
            "--z-threshold" => {
                z_threshold = value
                    .parse()
                    .ok()
                    .filter(|z: &f64| z.is_finite() && *z > 0.0)
                    .ok_or_else(|| {
                        TrainError::Usage(format!("--z-threshold must be positive, got '{value}'"))
                    })?;
            }
            other => return Err(TrainError::Usage(format!("unknown option '{other}'"))),
        }
        i += 2;
    }

    Ok(Some(TrainArgs {
        input: input.ok_or_else(|| TrainError::Usage("--input is required".to_string()))?,
        output: output.ok_or_else(|| TrainError::Usage("--output is required".to_string()))?,
        z_threshold,
    }))
}

fn read_history(path: &Path) -> Result<BTreeMap<TagId, Vec<f64>>, TrainError> {
    let input_error = |source| TrainError::Input {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(input_error)?;
    let mut history: BTreeMap<TagId, Vec<f64>> = BTreeMap::new();
    for row in reader.deserialize::<Row>() {
        let row = row.map_err(input_error)?;
        history
            .entry(TagId::new(row.tag_id.trim()))
            .or_default()
            .push(row.value);
    }
    Ok(history)
}

fn train(
    history: &BTreeMap<TagId, Vec<f64>>,
    z_threshold: f64,
) -> Result<BaselineModel, TrainError> {
    let mut model = BaselineModel::new(z_threshold);
    for (tag, values) in history {
        match model.fit_tag(tag, values) {
            Ok(baseline) => println!(
                "{tag}: mean {:.3}, std {:.3} over {} samples",
                baseline.mean, baseline.std, baseline.samples
            ),
            Err(e) => eprintln!("skipping {tag}: {e}"),
        }
    }
    if model.is_empty() {
        return Err(TrainError::NothingFitted);
    }
    Ok(model)
}

fn run(args: &[String]) -> Result<bool, TrainError> {
    let Some(args) = parse_args(args)? else {
        return Ok(false);
    };
    let history = read_history(&args.input)?;
    let model = train(&history, args.z_threshold)?;
    model.save(&args.output)?;
    println!(
        "Wrote model for {} tag(s) to {}",
        model.len(),
        args.output.display()
    );
    Ok(true)
}

fn print_help() {
    println!(
        r#"Train the Kora anomaly model from historical readings

USAGE:
    train-model --input <CSV> --output <JSON> [--z-threshold <Z>]

OPTIONS:
    --input <CSV>         History with tag_id and value columns
    --output <JSON>       Where to write the model
    --z-threshold <Z>     Z-score above which a reading is anomalous [default: 3]
    -h, --help            Print this help message
"#
    );
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            print_help();
            ExitCode::SUCCESS
        }
        Err(e @ TrainError::Usage(_)) => {
            eprintln!("error: {e}");
            print_help();
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("train-model")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn trains_and_writes_a_loadable_model() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("history.csv");
        let output = dir.path().join("model.json");
        let mut file = std::fs::File::create(&input).unwrap();
        writeln!(file, "timestamp_us,tag_id,value").unwrap();
        for (i, value) in [70.0, 72.0, 74.0, 76.0].iter().enumerate() {
            writeln!(file, "{i},T01,{value}").unwrap();
        }
        writeln!(file, "9,P01,3.5").unwrap();
        drop(file);

        let ok = run(&args(&[
            "--input",
            input.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
            "--z-threshold",
            "2.5",
        ]))
        .unwrap();
        assert!(ok);

        let model = BaselineModel::load(&output).unwrap();
        assert_eq!(model.z_threshold, 2.5);
        let t01 = model.baseline(&TagId::from("T01")).unwrap();
        assert_eq!(t01.mean, 73.0);
        assert_eq!(t01.samples, 4);
        // One sample is not enough to fit.
        assert!(model.baseline(&TagId::from("P01")).is_none());
    }

    #[test]
    fn history_without_fit_is_an_error() {
        let mut history = BTreeMap::new();
        history.insert(TagId::from("T01"), vec![1.0]);
        assert!(matches!(train(&history, 3.0), Err(TrainError::NothingFitted)));
    }

    #[test]
    fn argument_errors() {
        assert!(parse_args(&args(&["--help"])).unwrap().is_none());
        assert!(matches!(parse_args(&args(&["--input", "a.csv"])), Err(TrainError::Usage(_))));
        assert!(matches!(parse_args(&args(&["--output"])), Err(TrainError::Usage(_))));
        assert!(matches!(
            parse_args(&args(&["--input", "a", "--output", "b", "--z-threshold", "-1"])),
            Err(TrainError::Usage(_))
        ));
        assert!(matches!(parse_args(&args(&["--bogus", "x"])), Err(TrainError::Usage(_))));
    }

    #[test]
    fn unreadable_input_is_reported() {
        let dir = tempdir().unwrap();
        let err = read_history(&dir.path().join("missing.csv")).unwrap_err();
        assert!(matches!(err, TrainError::Input { .. }));
    }
}
