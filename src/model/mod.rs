mod axis;
mod beam;
mod header;

pub use axis::VelocityAxis;
pub use beam::{Beam, BeamError};
pub use header::HduHeader;
