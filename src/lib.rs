pub mod tick;
pub mod clock;
pub mod config;
pub mod packet;
pub mod traits;
pub mod xtal;
pub mod timebase;
pub mod jit;
pub mod beacon;
pub mod downlink;
pub mod dispatcher;
pub mod gps;
pub mod status;
pub mod sim;
