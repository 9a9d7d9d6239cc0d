/*!
Protocol core: shared state and the two execution contexts.

[`ProtocolCore`] owns the [`ProtocolState`] and wires the acquisition loop,
the control loop and the transport together. The state lives in an
[`ArcSwap`]: the control thread publishes a fresh immutable snapshot after
each applied command, and the acquisition thread loads the current
snapshot for every frame without ever taking a lock or waiting on the
control path.
*/

use crate::acquisition::{AcquisitionLoop, AcquisitionStats};
use crate::applicator::ControlFrameApplicator;
use crate::config::AcquisitionConfig;
use crate::control::{ControlInbox, ControlLoop, ControlPhase, ControlStats, PhaseCell};
use crate::hardware::AnalogInput;
use crate::transport::{Transport, TransportError};
use arc_swap::ArcSwap;
use crossbeam_channel::Receiver;
use shared::{ChannelConfig, ProtocolState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("protocol core already started")]
    AlreadyStarted,

    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] std::io::Error),
}

/// Statistics from both loops after shutdown
#[derive(Debug, Clone, Default)]
pub struct CoreStats {
    pub acquisition: Option<AcquisitionStats>,
    pub control: Option<ControlStats>,
}

/// Owner of the shared protocol state and both loops
pub struct ProtocolCore {
    channels: ChannelConfig,
    state: Arc<ArcSwap<ProtocolState>>,
    transport: Arc<dyn Transport>,
    inbox: ControlInbox,
    queue: Option<Receiver<Vec<u8>>>,
    phase: PhaseCell,
    running: Arc<AtomicBool>,
    acquisition: Option<JoinHandle<AcquisitionStats>>,
    control: Option<JoinHandle<ControlStats>>,
}

impl ProtocolCore {
    /// Create the core around an inbox/queue pair from [`crate::control::queue`]
    pub fn new(
        channels: ChannelConfig,
        transport: Arc<dyn Transport>,
        inbox: ControlInbox,
        queue: Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            channels,
            state: Arc::new(ArcSwap::from_pointee(ProtocolState::default())),
            transport,
            inbox,
            queue: Some(queue),
            phase: PhaseCell::default(),
            running: Arc::new(AtomicBool::new(true)),
            acquisition: None,
            control: None,
        }
    }

    /// Send the device descriptor verbatim
    pub fn register(&self, descriptor: &str) -> Result<(), TransportError> {
        info!(
            "📝 Registering device {} ({} byte descriptor)",
            self.channels.device_name,
            descriptor.len()
        );
        self.transport.send_bytes(descriptor.as_bytes())
    }

    /// Queue raw control bytes for the control loop
    pub fn on_control_bytes(&self, bytes: &[u8], len: usize) -> bool {
        self.inbox.deliver(bytes, len)
    }

    /// Current state snapshot
    pub fn state(&self) -> ProtocolState {
        **self.state.load()
    }

    pub fn control_phase(&self) -> ControlPhase {
        self.phase.get()
    }

    /// Flag both loops poll; clearing it stops them
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// True while the acquisition thread is still producing frames
    pub fn is_acquiring(&self) -> bool {
        self.acquisition.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the control and acquisition threads
    pub fn start(
        &mut self,
        input: Box<dyn AnalogInput>,
        applicator: ControlFrameApplicator,
        config: &AcquisitionConfig,
    ) -> Result<(), CoreError> {
        let queue = self.queue.take().ok_or(CoreError::AlreadyStarted)?;

        let control = ControlLoop::new(
            applicator,
            Arc::clone(&self.state),
            Arc::clone(&self.transport),
            queue,
            self.phase.clone(),
            Arc::clone(&self.running),
        );
        self.control = Some(
            thread::Builder::new()
                .name("control".to_string())
                .spawn(move || control.run())
                .map_err(|e| CoreError::Spawn("control", e))?,
        );

        let acquisition = AcquisitionLoop::new(
            input,
            self.channels.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.transport),
            Arc::clone(&self.running),
            config,
        );
        self.acquisition = Some(
            thread::Builder::new()
                .name("acquisition".to_string())
                .spawn(move || acquisition.run())
                .map_err(|e| CoreError::Spawn("acquisition", e))?,
        );

        info!("✅ Protocol core started for {}", self.channels.device_name);
        Ok(())
    }

    /// Stop both loops and collect their statistics
    pub fn shutdown(mut self) -> CoreStats {
        self.running.store(false, Ordering::SeqCst);

        let acquisition = self.acquisition.take().and_then(|handle| {
            handle
                .join()
                .map_err(|_| error!("Acquisition thread panicked"))
                .ok()
        });
        let control = self.control.take().and_then(|handle| {
            handle
                .join()
                .map_err(|_| error!("Control thread panicked"))
                .ok()
        });

        info!("🛑 Protocol core stopped");
        CoreStats { acquisition, control }
    }
}

impl Drop for ProtocolCore {
    fn drop(&mut self) {
        // Loops left running by a core that was never shut down stop on their own
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputConfig;
    use crate::control;
    use crate::hardware::ChannelSwitch;
    use crate::simulated::SimulatedDaq;
    use crate::transport::testing::RecordingTransport;
    use shared::{StimulationDataFrame, SwitchChannelMethod};
    use std::time::{Duration, Instant};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn new_core(method: SwitchChannelMethod) -> (ProtocolCore, Arc<RecordingTransport>, SimulatedDaq) {
        let channels = ChannelConfig::new("Dev1", method);
        let transport = Arc::new(RecordingTransport::default());
        let (inbox, queue) = control::queue();
        let output = OutputConfig {
            settle_delay_ms: 0,
            ..OutputConfig::default()
        };
        let daq = SimulatedDaq::new(&channels, &AcquisitionConfig::default(), &output);
        (ProtocolCore::new(channels, transport.clone(), inbox, queue), transport, daq)
    }

    fn start(core: &mut ProtocolCore, daq: SimulatedDaq, method: SwitchChannelMethod) {
        let (input, output, switch) = daq.split();
        let applicator = ControlFrameApplicator::new(
            ChannelConfig::new("Dev1", method),
            Box::new(output),
            switch.map(|s| Box::new(s) as Box<dyn ChannelSwitch>),
            &OutputConfig {
                settle_delay_ms: 0,
                ..OutputConfig::default()
            },
        );
        core.start(Box::new(input), applicator, &AcquisitionConfig::default()).unwrap();
    }

    #[test]
    fn test_register_sends_descriptor_verbatim() {
        let (core, transport, _daq) = new_core(SwitchChannelMethod::Single);
        core.register("{\"name\": \"stim\"}").unwrap();
        assert_eq!(transport.sent.lock().unwrap().as_slice(), &[b"{\"name\": \"stim\"}".to_vec()]);
    }

    #[test]
    fn test_control_reaches_data_frames() {
        let (mut core, transport, daq) = new_core(SwitchChannelMethod::Dual);
        start(&mut core, daq, SwitchChannelMethod::Dual);
        assert!(wait_for(|| transport.frame_count() > 0));

        let message = br#"{"normalised_current_level":0.5,"stimulation_length":50,"switch_channel":1}"#;
        assert!(core.on_control_bytes(message, message.len()));
        assert!(wait_for(|| core.state().has_shocked()));

        let state = core.state();
        assert_eq!(state.selected_channel, 1);
        assert_eq!(state.pulse_length_ms, 50);

        let stamped = wait_for(|| {
            transport
                .frames
                .lock()
                .unwrap()
                .iter()
                .filter_map(|bytes| StimulationDataFrame::from_bytes(bytes).ok())
                .any(|frame| frame.last_shock_on_device == state.last_timestamp)
        });
        assert!(stamped);
        assert!(core.is_acquiring());

        let stats = core.shutdown();
        assert!(stats.acquisition.unwrap().fault.is_none());
        assert_eq!(stats.control.unwrap().applied, 1);
    }

    #[test]
    fn test_failed_control_is_reported() {
        let (mut core, transport, daq) = new_core(SwitchChannelMethod::Dual);
        start(&mut core, daq, SwitchChannelMethod::Dual);

        let message = br#"{"switch_channel":5}"#;
        assert!(core.on_control_bytes(message, message.len()));
        assert!(wait_for(|| !transport.errors().is_empty()));
        assert_eq!(core.state(), ProtocolState::default());
        assert_eq!(core.control_phase(), ControlPhase::Idle);

        let stats = core.shutdown();
        assert_eq!(stats.control.unwrap().rejected, 1);
    }

    #[test]
    fn test_drop_stops_loops() {
        let (mut core, transport, daq) = new_core(SwitchChannelMethod::Single);
        start(&mut core, daq, SwitchChannelMethod::Single);
        assert!(wait_for(|| transport.frame_count() > 0));

        let running = core.running_flag();
        drop(core);
        assert!(!running.load(Ordering::SeqCst));

        // Acquisition stops within a frame or two of the flag clearing
        thread::sleep(Duration::from_millis(50));
        let frames = transport.frame_count();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(transport.frame_count(), frames);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (mut core, _transport, daq) = new_core(SwitchChannelMethod::Single);
        start(&mut core, daq, SwitchChannelMethod::Single);

        let channels = ChannelConfig::new("Dev1", SwitchChannelMethod::Single);
        let (input, output, _) =
            SimulatedDaq::new(&channels, &AcquisitionConfig::default(), &OutputConfig::default()).split();
        let applicator = ControlFrameApplicator::new(channels, Box::new(output), None, &OutputConfig::default());

        assert!(matches!(
            core.start(Box::new(input), applicator, &AcquisitionConfig::default()),
            Err(CoreError::AlreadyStarted)
        ));
        core.shutdown();
    }
}
