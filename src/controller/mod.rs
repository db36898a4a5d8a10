//! Low-level controller of the hand
//!
//! The controller is the single owner of everything the hardware reports. It
//! maps channel-addressed operations onto wire packets, routes every inbound
//! packet into per-channel caches and tracks which channels are enabled.
//!
//! # Request and get
//!
//! The serial link is too slow to query the hardware inside every getter, so
//! reads come in pairs: `request_*` asks the hardware to transmit a record,
//! `get_*` returns whatever was received last. Feedback getters therefore
//! return the latest snapshot, not the live value; the feedback poll worker
//! keeps the snapshots fresh.
//!
//! # Threading
//!
//! Inbound packets arrive on the receive worker thread while callers operate
//! from their own threads. All caches sit behind one mutex and getters copy
//! records out, so a reader observes either the old or the new record, never
//! a torn one.

pub mod types;

use crate::codec::{ByteBuffer, Decode, Encode};
use crate::error::{Error, Result};
use crate::protocol::{Opcode, SerialPacket, ALL_CHANNELS};
use crate::transport::{PacketCallback, SerialInterface, Transport};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use self::types::{
    AllChannelFeedback, Channel, ControlCommand, ControllerFeedback, ControllerState,
    CurrentSettings, EncoderSettings, PositionSettings, CHANNEL_COUNT,
};

/// Writing the high bits of `pwm_fault`/`pwm_otw` resets latched faults.
const FAULT_RESET_PATTERN: u16 = 0x001F;
/// Bit 9 of the channel bitmask powers the 12 V DC-DC converter.
const DCDC_ENABLE_BIT: u16 = 0x0200;
/// Bits 0-8 select the nine motor channels.
const ALL_CHANNEL_BITS: u16 = 0x01FF;

#[derive(Default)]
struct ControllerCaches {
    position_settings: [PositionSettings; CHANNEL_COUNT],
    current_settings: [CurrentSettings; CHANNEL_COUNT],
    feedback: [ControllerFeedback; CHANNEL_COUNT],
    controller_state: ControllerState,
    encoder_settings: EncoderSettings,
    enable_mask: u16,
}

/// Channel-addressed access to the motor controller.
pub struct Controller {
    serial: SerialInterface,
    caches: Mutex<ControllerCaches>,
}

impl Controller {
    /// Create a controller with no attached transport.
    ///
    /// The serial receive path holds only a weak reference back to the
    /// controller, so dropping the controller tears the callback down with it.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Controller>| {
            let back_ref = weak.clone();
            let callback: PacketCallback = Arc::new(move |packet, count| {
                if let Some(controller) = back_ref.upgrade() {
                    controller.handle_packet(packet, count);
                }
            });
            Controller {
                serial: SerialInterface::new(callback),
                caches: Mutex::new(ControllerCaches::default()),
            }
        })
    }

    /// Attach the byte device and start receiving.
    pub fn connect(&self, device: Box<dyn Transport>, receive_interval: Duration) -> Result<()> {
        self.serial.connect(device, receive_interval)
    }

    /// Stop receiving and release the byte device. All channels count as
    /// disabled afterwards.
    pub fn disconnect(&self) {
        self.serial.disconnect();
        if let Ok(mut caches) = self.caches.lock() {
            caches.enable_mask = 0;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.serial.is_open()
    }

    fn lock_caches(&self) -> Result<MutexGuard<'_, ControllerCaches>> {
        self.caches.lock().map_err(|_| Error::MutexPoisoned)
    }

    fn send(&self, opcode: Opcode, channel_nibble: u8, data: Vec<u8>) -> Result<()> {
        let mut packet = SerialPacket::new(SerialPacket::address_for(opcode, channel_nibble), data);
        self.serial.send_packet(&mut packet)
    }

    fn send_record<T: Encode>(&self, opcode: Opcode, channel_nibble: u8, record: &T) -> Result<()> {
        let mut buf = ByteBuffer::new();
        record.encode(&mut buf);
        self.send(opcode, channel_nibble, buf.into_vec())
    }

    // ========================================================================
    // Targets and feedback
    // ========================================================================

    /// Command a new target position [ticks] for one channel. The hardware
    /// acknowledges with a feedback record that lands in the cache.
    pub fn set_target(&self, channel: Channel, position: i32) -> Result<()> {
        self.send_record(
            Opcode::SetControlCommand,
            channel.index() as u8,
            &ControlCommand { position },
        )
    }

    /// Ask the hardware to transmit feedback for one channel.
    pub fn request_feedback(&self, channel: Channel) -> Result<()> {
        self.send(Opcode::GetControlFeedback, channel.index() as u8, Vec::new())
    }

    /// Ask the hardware to transmit feedback for every channel in one frame.
    pub fn request_feedback_all(&self) -> Result<()> {
        self.send(Opcode::GetControlFeedback, ALL_CHANNELS, Vec::new())
    }

    /// Latest feedback snapshot of a channel.
    pub fn get_controller_feedback(&self, channel: Channel) -> Result<ControllerFeedback> {
        Ok(self.lock_caches()?.feedback[channel.index()])
    }

    /// Latest feedback snapshots of all channels.
    pub fn get_controller_feedback_all(&self) -> Result<AllChannelFeedback> {
        Ok(AllChannelFeedback::new(self.lock_caches()?.feedback))
    }

    // ========================================================================
    // Enable / disable
    // ========================================================================

    /// Enable the control loops of one channel.
    pub fn enable_channel(&self, channel: Channel) -> Result<()> {
        let (warmup, state) = {
            let mut caches = self.lock_caches()?;
            // The DC-DC converter must come up before the first channel
            let warmup = (caches.enable_mask == 0).then(|| enable_state(DCDC_ENABLE_BIT));
            caches.enable_mask |= 1 << channel.index();
            let state = enable_state(DCDC_ENABLE_BIT | caches.enable_mask);
            caches.controller_state = state;
            (warmup, state)
        };

        if let Some(warmup) = warmup {
            self.send_record(Opcode::SetControllerState, channel.index() as u8, &warmup)?;
        }
        self.send_record(Opcode::SetControllerState, channel.index() as u8, &state)?;
        log::debug!("Enabled channel {}", channel);
        Ok(())
    }

    /// Enable the control loops of every channel with one broadcast.
    pub fn enable_all(&self) -> Result<()> {
        let (warmup, state) = {
            let mut caches = self.lock_caches()?;
            let warmup = (caches.enable_mask == 0).then(|| enable_state(DCDC_ENABLE_BIT));
            caches.enable_mask = ALL_CHANNEL_BITS;
            let state = enable_state(DCDC_ENABLE_BIT | ALL_CHANNEL_BITS);
            caches.controller_state = state;
            (warmup, state)
        };

        if let Some(warmup) = warmup {
            self.send_record(Opcode::SetControllerState, ALL_CHANNELS, &warmup)?;
        }
        self.send_record(Opcode::SetControllerState, ALL_CHANNELS, &state)?;
        log::debug!("Enabled all channels");
        Ok(())
    }

    /// Disable the control loops of one channel. The DC-DC converter stays
    /// powered while other channels remain enabled.
    pub fn disable_channel(&self, channel: Channel) -> Result<()> {
        let state = {
            let mut caches = self.lock_caches()?;
            caches.enable_mask &= !(1 << channel.index());
            let state = disable_state(caches.enable_mask);
            caches.controller_state = state;
            state
        };
        self.send_record(Opcode::SetControllerState, channel.index() as u8, &state)?;
        log::debug!("Disabled channel {}", channel);
        Ok(())
    }

    /// Disable every channel and power the converter down.
    pub fn disable_all(&self) -> Result<()> {
        let state = {
            let mut caches = self.lock_caches()?;
            caches.enable_mask = 0;
            let state = disable_state(0);
            caches.controller_state = state;
            state
        };
        self.send_record(Opcode::SetControllerState, ALL_CHANNELS, &state)?;
        log::debug!("Disabled all channels");
        Ok(())
    }

    /// Whether an enable has been sent for this channel.
    pub fn is_enabled(&self, channel: Channel) -> bool {
        self.caches
            .lock()
            .map(|caches| caches.enable_mask & (1 << channel.index()) != 0)
            .unwrap_or(false)
    }

    // ========================================================================
    // Controller settings
    // ========================================================================

    /// Activate new position controller settings for one channel.
    pub fn set_position_settings(
        &self,
        channel: Channel,
        settings: &PositionSettings,
    ) -> Result<()> {
        self.lock_caches()?.position_settings[channel.index()] = *settings;
        self.send_record(Opcode::SetPositionSettings, channel.index() as u8, settings)
    }

    /// Ask the hardware to transmit the active position settings.
    pub fn request_position_settings(&self, channel: Channel) -> Result<()> {
        self.send(
            Opcode::GetPositionSettings,
            channel.index() as u8,
            Vec::new(),
        )
    }

    /// Last known position settings of a channel.
    pub fn get_position_settings(&self, channel: Channel) -> Result<PositionSettings> {
        Ok(self.lock_caches()?.position_settings[channel.index()])
    }

    /// Activate new current controller settings for one channel.
    pub fn set_current_settings(&self, channel: Channel, settings: &CurrentSettings) -> Result<()> {
        self.lock_caches()?.current_settings[channel.index()] = *settings;
        self.send_record(Opcode::SetCurrentSettings, channel.index() as u8, settings)
    }

    /// Ask the hardware to transmit the active current settings.
    pub fn request_current_settings(&self, channel: Channel) -> Result<()> {
        self.send(Opcode::GetCurrentSettings, channel.index() as u8, Vec::new())
    }

    /// Last known current settings of a channel.
    pub fn get_current_settings(&self, channel: Channel) -> Result<CurrentSettings> {
        Ok(self.lock_caches()?.current_settings[channel.index()])
    }

    // ========================================================================
    // Controller state and encoders
    // ========================================================================

    /// Ask the hardware to transmit its controller state record.
    pub fn request_controller_state(&self) -> Result<()> {
        self.send(Opcode::GetControllerState, 0, Vec::new())
    }

    /// Last received controller state record.
    pub fn get_controller_state(&self) -> Result<ControllerState> {
        Ok(self.lock_caches()?.controller_state)
    }

    /// Send new encoder scaling values.
    pub fn set_encoder_values(&self, settings: &EncoderSettings) -> Result<()> {
        self.lock_caches()?.encoder_settings = *settings;
        self.send_record(Opcode::SetEncoderValues, 0, settings)
    }

    /// Ask the hardware to transmit the encoder scaling values.
    pub fn request_encoder_values(&self) -> Result<()> {
        self.send(Opcode::GetEncoderValues, 0, Vec::new())
    }

    /// Last received encoder scaling values.
    pub fn get_encoder_values(&self) -> Result<EncoderSettings> {
        Ok(self.lock_caches()?.encoder_settings)
    }

    // ========================================================================
    // Packet counting
    // ========================================================================

    pub fn sent_count(&self) -> u32 {
        self.serial.sent_count()
    }

    pub fn received_count(&self) -> u32 {
        self.serial.received_count()
    }

    pub fn reset_packet_counts(&self) {
        self.serial.reset_packet_counts();
    }

    // ========================================================================
    // Inbound routing
    // ========================================================================

    /// Interpret one verified inbound packet. Runs on the receive worker.
    fn handle_packet(&self, packet: &SerialPacket, count: u32) {
        let Some(opcode) = Opcode::from_nibble(packet.opcode_nibble()) else {
            log::warn!(
                "Dropping packet #{} with unknown opcode {:#x}",
                count,
                packet.opcode_nibble()
            );
            return;
        };
        let channel_nibble = packet.channel_nibble();
        let mut payload = ByteBuffer::from_vec(packet.data.clone());

        let Ok(mut caches) = self.caches.lock() else {
            log::error!("Controller cache mutex poisoned, dropping packet #{}", count);
            return;
        };

        match opcode {
            // A control command is acknowledged with fresh feedback, so both
            // opcodes carry the same payload inbound.
            Opcode::GetControlFeedback | Opcode::SetControlCommand => {
                if channel_nibble == ALL_CHANNELS {
                    let all = AllChannelFeedback::decode(&mut payload);
                    caches.feedback = all.feedbacks;
                    log::trace!("Received feedback for all channels (#{})", count);
                } else if let Some(channel) = Channel::from_index(channel_nibble as usize) {
                    caches.feedback[channel.index()] = ControllerFeedback::decode(&mut payload);
                    log::trace!("Received feedback for channel {} (#{})", channel, count);
                } else {
                    log::warn!("Feedback for out-of-range channel {}", channel_nibble);
                }
            }
            Opcode::GetPositionSettings => {
                if let Some(channel) = Channel::from_index(channel_nibble as usize) {
                    caches.position_settings[channel.index()] =
                        PositionSettings::decode(&mut payload);
                    log::debug!("Received position settings for channel {}", channel);
                } else {
                    log::warn!("Position settings for out-of-range channel {}", channel_nibble);
                }
            }
            Opcode::SetPositionSettings => {
                log::debug!("Position settings acknowledged for channel {}", channel_nibble);
            }
            Opcode::GetCurrentSettings => {
                if let Some(channel) = Channel::from_index(channel_nibble as usize) {
                    caches.current_settings[channel.index()] =
                        CurrentSettings::decode(&mut payload);
                    log::debug!("Received current settings for channel {}", channel);
                } else {
                    log::warn!("Current settings for out-of-range channel {}", channel_nibble);
                }
            }
            Opcode::SetCurrentSettings => {
                log::debug!("Current settings acknowledged for channel {}", channel_nibble);
            }
            Opcode::GetControllerState => {
                caches.controller_state = ControllerState::decode(&mut payload);
                log::debug!("Received controller state");
            }
            Opcode::SetControllerState => {
                log::debug!("Controller state acknowledged");
            }
            Opcode::GetEncoderValues => {
                caches.encoder_settings = EncoderSettings::decode(&mut payload);
                log::debug!("Received encoder values");
            }
            Opcode::SetEncoderValues => {
                log::debug!("Encoder values acknowledged");
            }
        }
    }
}

fn enable_state(channel_bits: u16) -> ControllerState {
    ControllerState {
        pwm_fault: FAULT_RESET_PATTERN,
        pwm_otw: FAULT_RESET_PATTERN,
        pwm_reset: channel_bits,
        pwm_active: channel_bits,
        pos_ctrl: 0x0001,
        cur_ctrl: 0x0001,
    }
}

fn disable_state(enable_mask: u16) -> ControllerState {
    let channel_bits = if enable_mask == 0 {
        0
    } else {
        DCDC_ENABLE_BIT | enable_mask
    };
    let loops = u16::from(enable_mask != 0);
    ControllerState {
        pwm_fault: FAULT_RESET_PATTERN,
        pwm_otw: FAULT_RESET_PATTERN,
        pwm_reset: channel_bits,
        pwm_active: channel_bits,
        pos_ctrl: loops,
        cur_ctrl: loops,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_packet, PacketReceiver, TX_PAYLOAD_SIZE};
    use crate::transport::MockTransport;
    use std::time::{Duration, Instant};

    const RECEIVE_INTERVAL: Duration = Duration::from_millis(1);

    fn connected_controller() -> (Arc<Controller>, MockTransport) {
        let controller = Controller::new();
        let mock = MockTransport::new();
        controller
            .connect(Box::new(mock.clone()), RECEIVE_INTERVAL)
            .expect("connect");
        (controller, mock)
    }

    fn written_packets(mock: &MockTransport) -> Vec<SerialPacket> {
        let mut receiver = PacketReceiver::new();
        mock.take_written()
            .into_iter()
            .filter_map(|byte| receiver.push_byte(byte))
            .collect()
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_set_target_frame_layout() {
        let (controller, mock) = connected_controller();
        controller.set_target(Channel::Pinky, 1508).expect("send");

        let packets = written_packets(&mock);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].address, 0x71);
        assert_eq!(packets[0].data.len(), TX_PAYLOAD_SIZE);
        assert_eq!(&packets[0].data[..4], &1508i32.to_le_bytes());
    }

    #[test]
    fn test_feedback_request_addresses() {
        let (controller, mock) = connected_controller();
        controller
            .request_feedback(Channel::MiddleDistal)
            .expect("send");
        controller.request_feedback_all().expect("send");

        let packets = written_packets(&mock);
        assert_eq!(packets[0].address, 0x40);
        assert_eq!(packets[1].address, 0xF0);
    }

    #[test]
    fn test_enable_disable_tracks_mask() {
        let (controller, mock) = connected_controller();
        assert!(!controller.is_enabled(Channel::Ring));

        controller.enable_channel(Channel::Ring).expect("enable");
        assert!(controller.is_enabled(Channel::Ring));
        assert!(!controller.is_enabled(Channel::Pinky));

        // First enable sends the DC-DC warm-up state and the channel state
        let packets = written_packets(&mock);
        assert_eq!(packets.len(), 2);
        let mut warmup = ByteBuffer::from_vec(packets[0].data.clone());
        let warmup = ControllerState::decode(&mut warmup);
        assert_eq!(warmup.pwm_reset, DCDC_ENABLE_BIT);
        let mut state = ByteBuffer::from_vec(packets[1].data.clone());
        let state = ControllerState::decode(&mut state);
        assert_eq!(state.pwm_reset, DCDC_ENABLE_BIT | (1 << 6));
        assert_eq!(state.pos_ctrl, 1);

        controller.disable_channel(Channel::Ring).expect("disable");
        assert!(!controller.is_enabled(Channel::Ring));
        let packets = written_packets(&mock);
        let mut state = ByteBuffer::from_vec(packets[0].data.clone());
        let state = ControllerState::decode(&mut state);
        assert_eq!(state.pwm_reset, 0);
        assert_eq!(state.pos_ctrl, 0);
    }

    #[test]
    fn test_enable_all_and_disable_all() {
        let (controller, mock) = connected_controller();
        controller.enable_all().expect("enable all");
        for channel in Channel::ALL {
            assert!(controller.is_enabled(channel));
        }
        let packets = written_packets(&mock);
        assert_eq!(packets.last().map(|p| p.address), Some(0xF7));

        controller.disable_all().expect("disable all");
        for channel in Channel::ALL {
            assert!(!controller.is_enabled(channel));
        }
    }

    #[test]
    fn test_inbound_single_feedback_updates_cache() {
        let (controller, mock) = connected_controller();

        let mut buf = ByteBuffer::new();
        ControllerFeedback {
            position: 4200,
            current: -120,
        }
        .encode(&mut buf);
        let reply = SerialPacket::new(
            SerialPacket::address_for(Opcode::SetControlCommand, Channel::Ring.index() as u8),
            buf.into_vec(),
        );
        mock.inject_read(&encode_packet(&reply));

        wait_for(|| controller.received_count() == 1);
        let feedback = controller
            .get_controller_feedback(Channel::Ring)
            .expect("cached feedback");
        assert_eq!(feedback.position, 4200);
        assert_eq!(feedback.current, -120);
    }

    #[test]
    fn test_inbound_all_channel_feedback_updates_every_cache() {
        let (controller, mock) = connected_controller();

        let mut feedbacks = [ControllerFeedback::default(); CHANNEL_COUNT];
        for (i, feedback) in feedbacks.iter_mut().enumerate() {
            feedback.position = i as i32 * 100;
            feedback.current = i as i16;
        }
        let mut buf = ByteBuffer::new();
        AllChannelFeedback::new(feedbacks).encode(&mut buf);
        let reply = SerialPacket::new(
            SerialPacket::address_for(Opcode::GetControlFeedback, ALL_CHANNELS),
            buf.into_vec(),
        );
        mock.inject_read(&encode_packet(&reply));

        wait_for(|| controller.received_count() == 1);
        for channel in Channel::ALL {
            let feedback = controller.get_controller_feedback(channel).expect("cached");
            assert_eq!(feedback.position, channel.index() as i32 * 100);
        }
    }

    #[test]
    fn test_unknown_opcode_is_dropped() {
        let (controller, mock) = connected_controller();
        let reply = SerialPacket::new(0x0A, vec![1, 2, 3]);
        mock.inject_read(&encode_packet(&reply));

        wait_for(|| controller.received_count() == 1);
        // Nothing to observe beyond "no crash" and untouched caches
        let feedback = controller
            .get_controller_feedback(Channel::ThumbFlexion)
            .expect("cached feedback");
        assert_eq!(feedback, ControllerFeedback::default());
    }

    #[test]
    fn test_settings_cache_on_set() {
        let (controller, _mock) = connected_controller();
        let settings = CurrentSettings {
            wmn: -300.0,
            wmx: 300.0,
            ky: 0.405,
            dt: 4e-6,
            imn: -25.0,
            imx: 25.0,
            kp: 1.0,
            ki: 10.0,
            umn: -255.0,
            umx: 255.0,
        };
        controller
            .set_current_settings(Channel::IndexDistal, &settings)
            .expect("send");
        assert_eq!(
            controller
                .get_current_settings(Channel::IndexDistal)
                .expect("cached"),
            settings
        );
    }

    #[test]
    fn test_disconnect_disables_channels() {
        let (controller, _mock) = connected_controller();
        controller.enable_channel(Channel::Pinky).expect("enable");
        controller.disconnect();
        assert!(!controller.is_connected());
        assert!(!controller.is_enabled(Channel::Pinky));
    }
}
