use crate::error::{Error, Result};

/// Per-stream credit accounting
///
/// Pure bookkeeping: it never blocks and never touches the wire. The
/// owning stream asks it how much it may send, reports what it received,
/// and emits whatever WindowUpdate it returns.
#[derive(Debug, Clone)]
pub struct FlowController {
    initial_window: u32,

    /// Credit left for sending
    send_window: u32,

    /// Credit the peer still holds for sending to us
    recv_window: u32,

    /// Payload bytes handed to the wire
    bytes_sent: u64,

    /// Sum of WindowUpdate deltas received
    bytes_credited: u64,
}

impl FlowController {
    pub fn new(initial_window: u32) -> Self {
        Self {
            initial_window,
            send_window: initial_window,
            recv_window: initial_window,
            bytes_sent: 0,
            bytes_credited: 0,
        }
    }

    pub fn initial_window(&self) -> u32 {
        self.initial_window
    }

    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    /// Total payload bytes granted for sending
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Total credit returned by the peer
    pub fn bytes_credited(&self) -> u64 {
        self.bytes_credited
    }

    /// Take up to `want` bytes of send credit, returning the amount granted
    pub fn reserve_send(&mut self, want: usize) -> u32 {
        let granted = want.min(self.send_window as usize) as u32;
        self.send_window -= granted;
        self.bytes_sent += u64::from(granted);
        granted
    }

    /// Apply a WindowUpdate delta from the peer
    pub fn credit_send(&mut self, stream_id: u32, delta: u32) -> Result<()> {
        self.send_window = self.send_window.checked_add(delta).ok_or_else(|| {
            Error::Protocol(format!(
                "Send window overflow on stream {}: {} + {}",
                stream_id, self.send_window, delta
            ))
        })?;
        self.bytes_credited += u64::from(delta);
        Ok(())
    }

    /// Account for `len` payload bytes arriving from the peer
    pub fn record_received(&mut self, stream_id: u32, len: u32) -> Result<()> {
        if len > self.recv_window {
            return Err(Error::FlowControl {
                stream_id,
                len,
                window: self.recv_window,
            });
        }
        self.recv_window -= len;
        Ok(())
    }

    /// Credit to return to the peer now that only `buffered` bytes are unread
    ///
    /// Updates are batched: nothing is returned until at least half of the
    /// initial window can be handed back.
    pub fn window_update(&mut self, buffered: usize) -> Option<u32> {
        let held = u64::from(self.recv_window) + buffered as u64;
        let delta = u64::from(self.initial_window).saturating_sub(held) as u32;
        let threshold = (self.initial_window / 2).max(1);
        if delta < threshold {
            return None;
        }
        self.recv_window += delta;
        Some(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_WINDOW_SIZE;

    #[test]
    fn test_reserve_never_exceeds_window() {
        let mut flow = FlowController::new(100);
        assert_eq!(flow.reserve_send(60), 60);
        assert_eq!(flow.reserve_send(60), 40);
        assert_eq!(flow.reserve_send(60), 0);
        assert_eq!(flow.send_window(), 0);
    }

    #[test]
    fn test_send_window_conservation() {
        let mut flow = FlowController::new(DEFAULT_WINDOW_SIZE);
        let initial = u64::from(DEFAULT_WINDOW_SIZE);
        let steps: [(usize, u32); 6] = [
            (1000, 0),
            (70_000, 500),
            (300_000, 0),
            (10, 128 * 1024),
            (0, 7),
            (200_000, 0),
        ];
        for (want, delta) in steps {
            flow.reserve_send(want);
            flow.credit_send(1, delta).unwrap();
            assert_eq!(
                u64::from(flow.send_window()) + flow.bytes_sent(),
                initial + flow.bytes_credited()
            );
        }
    }

    #[test]
    fn test_credit_overflow() {
        let mut flow = FlowController::new(DEFAULT_WINDOW_SIZE);
        assert!(matches!(
            flow.credit_send(3, u32::MAX),
            Err(Error::Protocol(_))
        ));
        assert_eq!(flow.send_window(), DEFAULT_WINDOW_SIZE);
    }

    #[test]
    fn test_receive_violation() {
        let mut flow = FlowController::new(10);
        flow.record_received(5, 10).unwrap();
        assert_eq!(flow.recv_window(), 0);
        assert!(matches!(
            flow.record_received(5, 1),
            Err(Error::FlowControl { stream_id: 5, len: 1, window: 0 })
        ));
    }

    #[test]
    fn test_window_update_is_batched() {
        let mut flow = FlowController::new(DEFAULT_WINDOW_SIZE);
        flow.record_received(1, DEFAULT_WINDOW_SIZE).unwrap();

        // Reader drained a little: not worth an update yet
        let buffered = DEFAULT_WINDOW_SIZE as usize - 1000;
        assert_eq!(flow.window_update(buffered), None);

        // Reader drained more than half
        let buffered = DEFAULT_WINDOW_SIZE as usize / 4;
        let delta = flow.window_update(buffered).unwrap();
        assert_eq!(delta, DEFAULT_WINDOW_SIZE - DEFAULT_WINDOW_SIZE / 4);
        assert_eq!(flow.recv_window() as usize + buffered, DEFAULT_WINDOW_SIZE as usize);

        // Nothing further to return until more is consumed
        assert_eq!(flow.window_update(buffered), None);
    }
}
