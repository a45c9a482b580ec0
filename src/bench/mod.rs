pub mod payload;
pub mod rate_limit;
pub mod receiver;
pub mod sender;
pub mod shutdown;
pub mod stats;

pub use self::payload::*;
pub use self::rate_limit::*;
pub use self::receiver::*;
pub use self::sender::*;
pub use self::shutdown::*;
pub use self::stats::*;
