pub mod evpi;
pub mod evppi;
pub mod evsi;
pub mod gp;
pub mod linalg;
