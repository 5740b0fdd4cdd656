// NoC packets exchanged between core models

use serde::{Deserialize, Serialize};
use sim::models::ModelMessage;
use sim::utils::errors::SimulationError;

use super::dram::Tile;
use crate::planner::{CoreCoord, McastAxis};

pub const PORT_NOC_IN: &str = "noc_in";
pub const PORT_LAUNCH: &str = "launch";

/// Output port carrying multicast data and the VALID flag along `axis`.
pub fn mcast_port(axis: McastAxis) -> &'static str {
  match axis {
    McastAxis::In0 => "in0_mcast",
    McastAxis::In1 => "in1_mcast",
  }
}

/// Output port carrying receiver-ready increments back to the sender of `axis`.
pub fn ready_port(axis: McastAxis) -> &'static str {
  match axis {
    McastAxis::In0 => "in0_ready",
    McastAxis::In1 => "in1_ready",
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NocPacket {
  /// Block tiles written into the receiver's reserved region of circular buffer `cb`.
  McastData { axis: McastAxis, cb: u8, step: u32, tiles: Vec<Tile> },
  /// Remote semaphore write. `landed` names a circular buffer whose reservation must already be filled.
  SemaphoreSet { semaphore: u32, value: u32, landed: Option<u8> },
  SemaphoreInc { semaphore: u32, from: CoreCoord },
}

impl NocPacket {
  pub fn to_message(&self, port: &str) -> Result<ModelMessage, SimulationError> {
    let content = serde_json::to_string(self).map_err(|_| SimulationError::InvalidModelState)?;
    Ok(ModelMessage {
      content,
      port_name: port.to_string(),
    })
  }

  pub fn decode(content: &str) -> Result<Self, SimulationError> {
    serde_json::from_str(content).map_err(|_| SimulationError::InvalidModelState)
  }

  pub fn kind(&self) -> &'static str {
    match self {
      NocPacket::McastData { .. } => "mcast_data",
      NocPacket::SemaphoreSet { .. } => "semaphore_set",
      NocPacket::SemaphoreInc { .. } => "semaphore_inc",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn packets_decode_from_message_content() {
    let p = NocPacket::SemaphoreInc {
      semaphore: 2,
      from: CoreCoord::new(1, 3),
    };
    let msg = p.to_message(ready_port(McastAxis::In1)).unwrap();
    assert_eq!(msg.port_name, "in1_ready");
    assert!(msg.content.contains("\"kind\":\"semaphore_inc\""));
    assert_eq!(NocPacket::decode(&msg.content).unwrap(), p);
  }

  #[test]
  fn garbage_is_an_invalid_state() {
    assert!(NocPacket::decode("{\"kind\":\"bogus\"}").is_err());
  }
}
