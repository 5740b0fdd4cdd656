use sim::simulator::{Message, Simulation};

use super::records::CoreAction;
use crate::arch::mesh::noc::PORT_LAUNCH;

/// Source id of messages the host puts on the mesh.
pub const HOST_ID: &str = "host";

/// Queue a launch for the core model `core_id`, delivered on the next step.
pub fn launch_core(simulation: &mut Simulation, core_id: &str) {
  let now = simulation.get_global_time();
  simulation.inject_input(Message::new(
    HOST_ID.to_string(),
    PORT_LAUNCH.to_string(),
    core_id.to_string(),
    PORT_LAUNCH.to_string(),
    now,
    CoreAction::Launch.to_string(),
  ));
}
