pub mod balance;
pub mod health;
pub mod target;

pub use balance::{Balancer, LoadGuard, Reservation, Strategy};
pub use health::HealthProber;
pub use target::Target;
