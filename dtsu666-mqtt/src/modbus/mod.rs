pub mod decode;
pub mod frame;
pub mod register;
pub mod transport;

pub use decode::decode;
pub use register::{Encoding, Quantity, RegisterMap, RegisterSpec};
pub use transport::{RegisterReader, RtuTransport};

pub use tokio_modbus::slave::{Slave as Unit, SlaveId as UnitId};

/// Modbus caps a single read at 125 registers (250 data bytes in a 256 byte ADU).
pub const MAX_READ_REGISTERS: u16 = 125;
