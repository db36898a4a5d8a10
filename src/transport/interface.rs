//! Serial interface: framing, packet counting and the receive worker
//!
//! [`SerialInterface`] owns the byte device between `connect` and
//! `disconnect`. Sending is synchronous and serialised by a mutex; receiving
//! runs on a dedicated [`PeriodicWorker`] that pulls one byte at a time
//! through a [`PacketReceiver`] and hands every verified frame to the
//! callback registered at construction.
//!
//! The interface keeps a sent/received packet count pair. The hardware
//! answers every request with exactly one reply, so equal counts are used as
//! the liveness signal after connecting. Unsolicited frames would inflate the
//! received count; the heuristic is kept because the hand only speaks when
//! spoken to.

use super::Transport;
use crate::error::{Error, Result};
use crate::protocol::{encode_packet, PacketReceiver, SerialPacket, TX_PAYLOAD_SIZE};
use crate::worker::PeriodicWorker;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Consumer of received packets together with the running received count.
pub type PacketCallback = Arc<dyn Fn(&SerialPacket, u32) + Send + Sync>;

/// Upper bound of bytes consumed per worker tick, so the stop flag is
/// observed even under a continuous byte stream.
const RECEIVE_BURST: usize = 512;

/// Framed serial connection to the motor controller.
pub struct SerialInterface {
    writer: Mutex<Option<Box<dyn Transport>>>,
    receive_worker: Mutex<Option<PeriodicWorker>>,
    callback: PacketCallback,
    sent: AtomicU32,
    received: Arc<AtomicU32>,
}

impl SerialInterface {
    /// Create a closed interface. Every packet that later arrives on the wire
    /// is handed to `callback` on the receive worker thread.
    pub fn new(callback: PacketCallback) -> Self {
        SerialInterface {
            writer: Mutex::new(None),
            receive_worker: Mutex::new(None),
            callback,
            sent: AtomicU32::new(0),
            received: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Take ownership of the byte device and start the receive worker.
    ///
    /// The worker reads on a cloned handle, so sends never wait behind a
    /// blocked device read.
    pub fn connect(&self, device: Box<dyn Transport>, receive_interval: Duration) -> Result<()> {
        self.disconnect();

        let mut reader = device.try_clone()?;
        let mut receiver = PacketReceiver::new();
        let received = Arc::clone(&self.received);
        let callback = Arc::clone(&self.callback);

        let worker = PeriodicWorker::spawn("hasta-receive", receive_interval, move || {
            receive_step(reader.as_mut(), &mut receiver, &received, &callback)
        })?;

        *self.writer.lock().map_err(|_| Error::MutexPoisoned)? = Some(device);
        *self.receive_worker.lock().map_err(|_| Error::MutexPoisoned)? = Some(worker);

        log::debug!("Serial device opened and receive worker started");
        Ok(())
    }

    /// Stop the receive worker and release the byte device.
    pub fn disconnect(&self) {
        let worker = self
            .receive_worker
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(mut worker) = worker {
            worker.stop();
            if worker.join().is_err() {
                log::error!("Receive worker did not shut down cleanly");
            } else {
                log::debug!("Receive worker terminated");
            }
        }

        if let Ok(mut slot) = self.writer.lock() {
            if slot.take().is_some() {
                log::debug!("Serial device handle closed");
            }
        }
    }

    /// Whether a byte device is currently attached.
    pub fn is_open(&self) -> bool {
        self.writer
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Encode and write one frame. Counts as one sent packet.
    ///
    /// The packet index is stamped from the sent counter and the payload is
    /// padded to the fixed frame size the controller firmware expects.
    pub fn send_packet(&self, packet: &mut SerialPacket) -> Result<()> {
        let mut guard = self.writer.lock().map_err(|_| Error::MutexPoisoned)?;
        let device = guard.as_mut().ok_or(Error::TransportClosed)?;

        packet.index = (self.sent.load(Ordering::Relaxed) & 0xFF) as u8;
        packet.data.resize(TX_PAYLOAD_SIZE, 0);

        let bytes = encode_packet(packet);
        device.write_all(&bytes)?;
        device.flush()?;

        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of packets sent since the last counter reset.
    pub fn sent_count(&self) -> u32 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Number of verified packets received since the last counter reset.
    pub fn received_count(&self) -> u32 {
        self.received.load(Ordering::Relaxed)
    }

    /// Zero both packet counters.
    pub fn reset_packet_counts(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.received.store(0, Ordering::Relaxed);
    }
}

impl Drop for SerialInterface {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// One receive tick: drain pending bytes through the frame receiver.
/// Returns whether any byte was consumed.
fn receive_step(
    device: &mut dyn Transport,
    receiver: &mut PacketReceiver,
    received: &AtomicU32,
    callback: &PacketCallback,
) -> bool {
    let mut progressed = false;
    let mut byte = [0u8; 1];
    for _ in 0..RECEIVE_BURST {
        match device.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                progressed = true;
                if let Some(packet) = receiver.push_byte(byte[0]) {
                    let count = received.fetch_add(1, Ordering::Relaxed) + 1;
                    callback(&packet, count);
                }
            }
            Err(e) => {
                log::debug!("Serial read error: {}", e);
                break;
            }
        }
    }
    progressed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, PACKET_OVERHEAD};
    use crate::transport::MockTransport;
    use std::time::Instant;

    const RECEIVE_INTERVAL: Duration = Duration::from_millis(2);

    fn interface_with_sink() -> (SerialInterface, Arc<Mutex<Vec<SerialPacket>>>) {
        let sink: Arc<Mutex<Vec<SerialPacket>>> = Arc::new(Mutex::new(Vec::new()));
        let packets = Arc::clone(&sink);
        let callback: PacketCallback = Arc::new(move |packet, _count| {
            packets.lock().unwrap().push(packet.clone());
        });
        (SerialInterface::new(callback), sink)
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_send_pads_and_counts() {
        let (interface, _sink) = interface_with_sink();
        let mock = MockTransport::new();
        interface
            .connect(Box::new(mock.clone()), RECEIVE_INTERVAL)
            .expect("connect");

        let mut packet = SerialPacket::new(
            SerialPacket::address_for(Opcode::SetControlCommand, 2),
            vec![0x10, 0x20],
        );
        interface.send_packet(&mut packet).expect("send");

        let written = mock.get_written();
        assert_eq!(written.len(), TX_PAYLOAD_SIZE + PACKET_OVERHEAD);
        assert_eq!(packet.index, 0);
        assert_eq!(interface.sent_count(), 1);

        // Second send gets the next index stamp
        let mut next = SerialPacket::new(packet.address, vec![]);
        interface.send_packet(&mut next).expect("send");
        assert_eq!(next.index, 1);
        assert_eq!(interface.sent_count(), 2);
    }

    #[test]
    fn test_send_without_device_fails() {
        let (interface, _sink) = interface_with_sink();
        let mut packet = SerialPacket::new(0x01, vec![]);
        assert!(matches!(
            interface.send_packet(&mut packet),
            Err(Error::TransportClosed)
        ));
    }

    #[test]
    fn test_receive_worker_delivers_packets() {
        let (interface, sink) = interface_with_sink();
        let mock = MockTransport::new();
        interface
            .connect(Box::new(mock.clone()), RECEIVE_INTERVAL)
            .expect("connect");

        let packet = SerialPacket::new(0x40, vec![9, 8, 7]);
        mock.inject_read(&encode_packet(&packet));
        wait_for(|| interface.received_count() == 1);

        assert_eq!(interface.received_count(), 1);
        assert_eq!(sink.lock().unwrap().as_slice(), &[packet]);
    }

    #[test]
    fn test_counter_reset_and_disconnect() {
        let (interface, _sink) = interface_with_sink();
        let mock = MockTransport::new();
        interface
            .connect(Box::new(mock.clone()), RECEIVE_INTERVAL)
            .expect("connect");
        assert!(interface.is_open());

        let mut packet = SerialPacket::new(0x01, vec![]);
        interface.send_packet(&mut packet).expect("send");
        interface.reset_packet_counts();
        assert_eq!(interface.sent_count(), 0);
        assert_eq!(interface.received_count(), 0);

        interface.disconnect();
        assert!(!interface.is_open());
        assert!(interface.send_packet(&mut packet).is_err());
    }
}
