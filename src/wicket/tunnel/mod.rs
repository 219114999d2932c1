pub mod control;
pub mod gateway;
pub mod pending;
pub mod pipe;
pub mod protocol;
pub mod relay;
