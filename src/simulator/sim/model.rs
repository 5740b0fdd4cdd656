use log::{log_enabled, trace, Level};
use sim::models::model_trait::DevsModel;
use sim::simulator::Simulation;
use std::fs::File;
use std::io::{self, BufWriter, Result, Write};

/// Longest message content written verbatim to the log; tile payloads are summarized.
const MAX_CONTENT_CHARS: usize = 160;

fn summarize(content: &str) -> String {
  if content.len() <= MAX_CONTENT_CHARS {
    return content.to_string();
  }
  let mut cut = MAX_CONTENT_CHARS;
  while !content.is_char_boundary(cut) {
    cut -= 1;
  }
  format!("{}... ({} bytes)", &content[..cut], content.len())
}

/// Deliver pending messages and fire the models that are due. Returns the
/// number of messages delivered by this step.
pub fn model_step(simulation: &mut Simulation, trace_writer: &mut Option<BufWriter<File>>) -> Result<usize> {
  let delivered = {
    let messages = simulation.get_messages();
    if log_enabled!(Level::Trace) {
      for msg in messages.iter() {
        trace!(
          "[MSG] t={:.1} {}:{} -> {}:{} | {}",
          msg.time(),
          msg.source_id(),
          msg.source_port(),
          msg.target_id(),
          msg.target_port(),
          summarize(msg.content())
        );
      }
    }

    if let Some(writer) = trace_writer {
      for msg in messages.iter() {
        let trace_entry = serde_json::json!({
          "time": msg.time(),
          "source": msg.source_id(),
          "source_port": msg.source_port(),
          "target": msg.target_id(),
          "target_port": msg.target_port(),
          "content": summarize(msg.content()),
        });
        writeln!(writer, "{}", trace_entry)?;
      }
      writer.flush()?;
    }
    messages.len()
  };

  simulation
    .step()
    .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("Simulation error: {:?}", e)))?;
  Ok(delivered)
}

/// Earliest internal event over every model.
pub fn until_next_event(simulation: &mut Simulation) -> f64 {
  simulation
    .models()
    .iter()
    .fold(f64::INFINITY, |min, model| f64::min(min, model.until_next_event()))
}

/// Bound on how long a run may go without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchdog {
  pub max_steps: u64,
}

/// Why [`run_until`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
  Completed,
  /// No messages in flight and no model has a future event.
  Quiescent,
  StepLimit,
}

/// Outcome of [`run_until`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
  pub end: RunEnd,
  pub steps: u64,
  pub delivered: u64,
}

/// Step `simulation` until `done` holds or the watchdog trips.
pub fn run_until(
  simulation: &mut Simulation,
  trace_writer: &mut Option<BufWriter<File>>,
  watchdog: Watchdog,
  mut done: impl FnMut() -> bool,
) -> Result<RunSummary> {
  let mut steps = 0u64;
  let mut delivered = 0u64;
  let end = loop {
    if done() {
      break RunEnd::Completed;
    }
    // stepping an idle simulation would advance time to infinity
    if simulation.get_messages().is_empty() && until_next_event(simulation) == f64::INFINITY {
      break RunEnd::Quiescent;
    }
    if steps >= watchdog.max_steps {
      break RunEnd::StepLimit;
    }
    delivered += model_step(simulation, trace_writer)? as u64;
    steps += 1;
  };
  Ok(RunSummary { end, steps, delivered })
}
