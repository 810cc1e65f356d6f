pub mod candidate;
pub mod profile;
pub mod provenance;
pub mod quarantine;
pub mod result;

pub use candidate::*;
pub use profile::*;
pub use provenance::*;
pub use quarantine::*;
pub use result::*;
