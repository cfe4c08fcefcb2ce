//! Core module containing the main functionality of Fieldpoll
//!
//! This module provides:
//! - Transport layer for communication links (TCP, serial)
//! - Link workers, transactions and priority queues
//! - Field device protocols (text-line meters, binary cameras, HTTP)
//! - Virtual device simulation

pub mod comm;
pub mod protocol;
pub mod simulator;
pub mod transport;
