//! Business operations shared by the HTTP routes and the worker

pub mod calls;
pub mod campaigns;
pub mod inbox;
pub mod notifications;
pub mod presence;
pub mod reports;
pub mod tickets;
