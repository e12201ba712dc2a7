use kora_core::adapter::ProtocolAdapter;
use kora_core::error::CommunicationError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Input,
    Holding,
}

/// Parsed tag address: `ir:<reg>` or `hr:<reg>`, optionally `/<scale>`.
/// The raw register is divided by the scale on read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterAddress {
    pub kind: RegisterKind,
    pub register: u16,
    pub scale: f64,
}

impl RegisterAddress {
    pub fn parse(address: &str) -> Result<Self, CommunicationError> {
        let invalid = |reason: &str| CommunicationError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let (kind, rest) = match address.split_once(':') {
            Some(("ir", rest)) => (RegisterKind::Input, rest),
            Some(("hr", rest)) => (RegisterKind::Holding, rest),
            _ => return Err(invalid("expected ir:<register> or hr:<register>")),
        };
        let (register, scale) = match rest.split_once('/') {
            Some((register, scale)) => {
                let scale: f64 = scale.parse().map_err(|_| invalid("scale is not a number"))?;
                (register, scale)
            }
            None => (rest, 1.0),
        };
        let register: u16 = register
            .parse()
            .map_err(|_| invalid("register must be 0-65535"))?;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(invalid("scale must be positive"));
        }
        Ok(Self {
            kind,
            register,
            scale,
        })
    }

    pub fn decode(&self, raw: u16) -> f64 {
        raw as f64 / self.scale
    }

    pub fn encode(&self, value: f64) -> Option<u16> {
        let raw = (value * self.scale).round();
        (0.0..=u16::MAX as f64).contains(&raw).then_some(raw as u16)
    }
}

/// Modbus TCP device. Calls run on a private current-thread runtime and are
/// bounded by the caller's timeout; an I/O error drops the connection so the
/// next cycle reconnects.
pub struct ModbusAdapter {
    endpoint: SocketAddr,
    connect_timeout: Duration,
    runtime: Runtime,
    ctx: Option<Context>,
}

impl ModbusAdapter {
    pub fn new(endpoint: &str, connect_timeout: Duration) -> Result<Self, CommunicationError> {
        let endpoint: SocketAddr =
            endpoint
                .parse()
                .map_err(|e: std::net::AddrParseError| CommunicationError::InvalidAddress {
                    address: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CommunicationError::ConnectFailed(e.to_string()))?;
        Ok(Self {
            endpoint,
            connect_timeout,
            runtime,
            ctx: None,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn drop_connection(&mut self, reason: &str) {
        if self.ctx.take().is_some() {
            tracing::warn!(endpoint = %self.endpoint, reason, "Modbus connection dropped");
        }
    }
}

impl ProtocolAdapter for ModbusAdapter {
    fn connect(&mut self) -> Result<(), CommunicationError> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let endpoint = self.endpoint;
        match self
            .runtime
            .block_on(timeout(self.connect_timeout, tcp::connect(endpoint)))
        {
            Ok(Ok(ctx)) => {
                tracing::info!(endpoint = %endpoint, "Connected to Modbus TCP");
                self.ctx = Some(ctx);
                Ok(())
            }
            Ok(Err(e)) => Err(CommunicationError::ConnectFailed(e.to_string())),
            Err(_) => Err(CommunicationError::ConnectFailed(format!(
                "connect to {} timed out after {} ms",
                endpoint,
                self.connect_timeout.as_millis()
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn read(&mut self, address: &str, limit: Duration) -> Result<f64, CommunicationError> {
        let target = RegisterAddress::parse(address)?;
        let Self { runtime, ctx, .. } = self;
        let ctx = ctx.as_mut().ok_or(CommunicationError::NotConnected)?;

        let result = runtime.block_on(async {
            match target.kind {
                RegisterKind::Input => {
                    timeout(limit, ctx.read_input_registers(target.register, 1)).await
                }
                RegisterKind::Holding => {
                    timeout(limit, ctx.read_holding_registers(target.register, 1)).await
                }
            }
        });

        match result {
            Ok(Ok(words)) => words
                .first()
                .map(|&raw| target.decode(raw))
                .ok_or_else(|| CommunicationError::Device {
                    address: address.to_string(),
                    message: "empty register response".to_string(),
                }),
            Ok(Err(e)) => {
                self.drop_connection(&e.to_string());
                Err(CommunicationError::Device {
                    address: address.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                self.drop_connection("read timed out");
                Err(CommunicationError::Timeout {
                    address: address.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    fn write(
        &mut self,
        address: &str,
        value: f64,
        limit: Duration,
    ) -> Result<(), CommunicationError> {
        let target = RegisterAddress::parse(address)?;
        if target.kind != RegisterKind::Holding {
            return Err(CommunicationError::InvalidAddress {
                address: address.to_string(),
                reason: "input registers are read-only".to_string(),
            });
        }
        let raw = target
            .encode(value)
            .ok_or_else(|| CommunicationError::InvalidAddress {
                address: address.to_string(),
                reason: format!("value {value} does not fit a 16-bit register"),
            })?;

        let Self { runtime, ctx, .. } = self;
        let ctx = ctx.as_mut().ok_or(CommunicationError::NotConnected)?;
        match runtime.block_on(timeout(limit, ctx.write_single_register(target.register, raw))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.drop_connection(&e.to_string());
                Err(CommunicationError::Device {
                    address: address.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                self.drop_connection("write timed out");
                Err(CommunicationError::Timeout {
                    address: address.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register_addresses() {
        assert_eq!(
            RegisterAddress::parse("ir:3").unwrap(),
            RegisterAddress {
                kind: RegisterKind::Input,
                register: 3,
                scale: 1.0
            }
        );
        let hr = RegisterAddress::parse("hr:40/10").unwrap();
        assert_eq!(hr.kind, RegisterKind::Holding);
        assert_eq!(hr.decode(735), 73.5);
        assert_eq!(hr.encode(73.5), Some(735));
        assert_eq!(hr.encode(-1.0), None);
        assert_eq!(hr.encode(7000.0), None);
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["T01", "ir:", "ir:70000", "xr:1", "hr:1/0", "hr:1/abc", "ir:1/-2"] {
            assert!(
                matches!(
                    RegisterAddress::parse(bad),
                    Err(CommunicationError::InvalidAddress { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn read_before_connect_is_not_connected() {
        let mut adapter = ModbusAdapter::new("127.0.0.1:5020", Duration::from_millis(100)).unwrap();
        assert!(!adapter.is_connected());
        assert_eq!(
            adapter.read("ir:0", Duration::from_millis(10)),
            Err(CommunicationError::NotConnected)
        );
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        assert!(matches!(
            ModbusAdapter::new("not an address", Duration::from_millis(100)),
            Err(CommunicationError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn write_to_input_register_is_rejected() {
        let mut adapter = ModbusAdapter::new("127.0.0.1:5020", Duration::from_millis(100)).unwrap();
        assert!(matches!(
            adapter.write("ir:0", 1.0, Duration::from_millis(10)),
            Err(CommunicationError::InvalidAddress { .. })
        ));
    }
}
