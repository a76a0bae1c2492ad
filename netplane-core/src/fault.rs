//! Records of runtime faults isolated at a boundary (scheduler tick, timer
//! callback, event dispatch) instead of being propagated.

use crate::{id::DeviceId, protocol_type::ProtocolType};
use std::{any::Any, fmt::Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOrigin {
    Initialize,
    Update,
    Timer,
    Handler,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub device: Option<DeviceId>,
    pub protocol: Option<ProtocolType>,
    pub origin: FaultOrigin,
    pub message: String,
}

impl Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} fault", self.origin)?;
        if let Some(protocol) = self.protocol {
            write!(f, " in {}", protocol)?;
        }
        if let Some(device) = self.device {
            write!(f, " on {}", device)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
