use crate::adapter::ProtocolAdapter;
use crate::error::CommunicationError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Duration;

/// One scripted response for an address.
#[derive(Debug, Clone, PartialEq)]
pub enum SimStep {
    Value(f64),
    Fail(String),
}

#[derive(Debug, Default)]
struct Channel {
    script: VecDeque<SimStep>,
    forced: Option<f64>,
    latency: Duration,
}

/// Simulated PLC with a seeded generator, so runs are reproducible.
///
/// Unscripted addresses return uniform values inside `band`, rounded to two
/// decimals. Scripted steps take precedence, then the last written value.
#[derive(Debug)]
pub struct SimulatedAdapter {
    rng: StdRng,
    band: (f64, f64),
    connected: bool,
    connect_failures: u32,
    connect_calls: u32,
    channels: HashMap<String, Channel>,
}

impl SimulatedAdapter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            band: (20.0, 120.0),
            connected: false,
            connect_failures: 0,
            connect_calls: 0,
            channels: HashMap::new(),
        }
    }

    pub fn with_band(mut self, min: f64, max: f64) -> Self {
        self.band = if min <= max { (min, max) } else { (max, min) };
        self
    }

    /// Queue values returned by the next reads of `address`.
    pub fn script<I>(&mut self, address: &str, values: I)
    where
        I: IntoIterator<Item = f64>,
    {
        let channel = self.channels.entry(address.to_string()).or_default();
        channel.script.extend(values.into_iter().map(SimStep::Value));
    }

    pub fn push_step(&mut self, address: &str, step: SimStep) {
        self.channels
            .entry(address.to_string())
            .or_default()
            .script
            .push_back(step);
    }

    /// Make the next `count` reads of `address` fail.
    pub fn fail_next(&mut self, address: &str, count: usize) {
        for _ in 0..count {
            self.push_step(address, SimStep::Fail("injected fault".to_string()));
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_connects(&mut self, count: u32) {
        self.connect_failures = count;
    }

    /// Simulated response time of `address`.
    pub fn set_latency(&mut self, address: &str, latency: Duration) {
        self.channels.entry(address.to_string()).or_default().latency = latency;
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls
    }

    fn random_value(&mut self) -> f64 {
        let (min, max) = self.band;
        if min == max {
            return min;
        }
        let raw: f64 = self.rng.gen_range(min..max);
        (raw * 100.0).round() / 100.0
    }
}

impl ProtocolAdapter for SimulatedAdapter {
    fn connect(&mut self) -> Result<(), CommunicationError> {
        self.connect_calls += 1;
        if self.connected {
            return Ok(());
        }
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(CommunicationError::ConnectFailed(
                "simulated PLC unreachable".to_string(),
            ));
        }
        self.connected = true;
        log::info!("Connected to simulated PLC");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read(&mut self, address: &str, timeout: Duration) -> Result<f64, CommunicationError> {
        if !self.connected {
            return Err(CommunicationError::NotConnected);
        }

        let (step, forced, latency) = match self.channels.get_mut(address) {
            Some(channel) => (channel.script.pop_front(), channel.forced, channel.latency),
            None => (None, None, Duration::ZERO),
        };

        if latency > timeout {
            thread::sleep(timeout);
            return Err(CommunicationError::Timeout {
                address: address.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        match step {
            Some(SimStep::Value(value)) => Ok(value),
            Some(SimStep::Fail(message)) => Err(CommunicationError::Device {
                address: address.to_string(),
                message,
            }),
            None => Ok(match forced {
                Some(value) => value,
                None => self.random_value(),
            }),
        }
    }

    fn write(
        &mut self,
        address: &str,
        value: f64,
        _timeout: Duration,
    ) -> Result<(), CommunicationError> {
        if !self.connected {
            return Err(CommunicationError::NotConnected);
        }
        if !value.is_finite() {
            return Err(CommunicationError::InvalidAddress {
                address: address.to_string(),
                reason: format!("cannot write non-finite value {value}"),
            });
        }
        log::debug!("Writing {} to simulated address {}", value, address);
        self.channels.entry(address.to_string()).or_default().forced = Some(value);
        Ok(())
    }
}
