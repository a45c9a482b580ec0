pub mod mem;
pub mod quic;
pub mod stream;
pub mod trace;
pub use self::quic::*;
pub use self::stream::*;
pub use self::trace::*;
