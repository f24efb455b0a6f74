pub mod bell;
pub mod music;
pub mod state;
