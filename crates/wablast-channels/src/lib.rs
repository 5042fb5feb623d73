//! # Wablast Channels
//! Messaging gateway and connection directory implementations.

pub mod whatsapp;

pub use whatsapp::EvolutionGateway;
