pub mod logging;
pub mod radio;
pub mod sensor;
