pub mod ondemand;
pub mod pausable;

pub use ondemand::OnDemandSupervisor;
pub use pausable::PausableSupervisor;
