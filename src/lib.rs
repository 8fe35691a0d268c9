pub mod app;
pub mod audio;
pub mod logger;
pub mod nes;
