pub mod battery;
pub mod chemistry;
pub mod load;
pub mod measurement;
pub mod pv;

pub use battery::*;
pub use chemistry::*;
pub use load::*;
pub use measurement::*;
pub use pv::*;
