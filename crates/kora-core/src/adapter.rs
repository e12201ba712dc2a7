use crate::error::CommunicationError;
use std::time::Duration;

/// Device communication contract shared by the simulator and real drivers.
///
/// `connect` is idempotent and may be retried. `read` and `write` must
/// return within `timeout`, reporting [`CommunicationError::Timeout`]
/// rather than blocking past it.
pub trait ProtocolAdapter: Send {
    fn connect(&mut self) -> Result<(), CommunicationError>;
    fn is_connected(&self) -> bool;
    fn read(&mut self, address: &str, timeout: Duration) -> Result<f64, CommunicationError>;
    fn write(
        &mut self,
        address: &str,
        value: f64,
        timeout: Duration,
    ) -> Result<(), CommunicationError>;
}

impl<A: ProtocolAdapter + ?Sized> ProtocolAdapter for Box<A> {
    fn connect(&mut self) -> Result<(), CommunicationError> {
        (**self).connect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn read(&mut self, address: &str, timeout: Duration) -> Result<f64, CommunicationError> {
        (**self).read(address, timeout)
    }

    fn write(
        &mut self,
        address: &str,
        value: f64,
        timeout: Duration,
    ) -> Result<(), CommunicationError> {
        (**self).write(address, value, timeout)
    }
}
