//! Packet-chunked bulk reads shared by both backends

use crate::error::TransferError;
use tracing::debug;

/// Fill `buf` by repeatedly reading at most `chunk_size` bytes
///
/// Stops when the buffer is full or a chunk comes back short, which marks
/// the end of the device's current packet. A failed chunk after some bytes
/// have arrived ends the read with the bytes accumulated so far; only a
/// failure before any progress is returned as an error.
pub(crate) fn read_chunked<F>(
    buf: &mut [u8],
    chunk_size: usize,
    mut read_chunk: F,
) -> Result<usize, TransferError>
where
    F: FnMut(&mut [u8]) -> Result<usize, TransferError>,
{
    let chunk_size = chunk_size.max(1);
    let mut total = 0;

    while total < buf.len() {
        let end = buf.len().min(total + chunk_size);
        let chunk = &mut buf[total..end];
        let requested = chunk.len();

        match read_chunk(chunk) {
            Ok(received) => {
                let received = received.min(requested);
                total += received;
                if received < requested {
                    break;
                }
            }
            Err(e) if total > 0 => {
                debug!("Chunked read stopped after {} bytes: {}", total, e);
                return Ok(total);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted chunk results, filling each chunk with a marker byte
    fn scripted(
        script: Vec<Result<usize, TransferError>>,
    ) -> (
        impl FnMut(&mut [u8]) -> Result<usize, TransferError>,
        std::rc::Rc<std::cell::RefCell<Vec<usize>>>,
    ) {
        let mut script: VecDeque<_> = script.into();
        let requests = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let log = requests.clone();
        let f = move |chunk: &mut [u8]| {
            log.borrow_mut().push(chunk.len());
            let result = script.pop_front().unwrap_or(Err(TransferError::Timeout));
            if let Ok(n) = result {
                let len = chunk.len();
                chunk[..n.min(len)].fill(0xAB);
            }
            result
        };
        (f, requests)
    }

    #[test]
    fn test_short_packet_terminates() {
        let (f, requests) = scripted(vec![Ok(64), Ok(64), Ok(64), Ok(30)]);
        let mut buf = [0u8; 256];
        assert_eq!(read_chunked(&mut buf, 64, f), Ok(222));
        assert_eq!(*requests.borrow(), vec![64, 64, 64, 64]);
        assert!(buf[..222].iter().all(|b| *b == 0xAB));
        assert!(buf[222..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_full_buffer_stops_without_extra_read() {
        let (f, requests) = scripted(vec![Ok(64), Ok(64)]);
        let mut buf = [0u8; 128];
        assert_eq!(read_chunked(&mut buf, 64, f), Ok(128));
        assert_eq!(requests.borrow().len(), 2);
    }

    #[test]
    fn test_last_chunk_is_clamped_to_remaining() {
        let (f, requests) = scripted(vec![Ok(64), Ok(36)]);
        let mut buf = [0u8; 100];
        assert_eq!(read_chunked(&mut buf, 64, f), Ok(100));
        assert_eq!(*requests.borrow(), vec![64, 36]);
    }

    #[test]
    fn test_timeout_before_progress_is_an_error() {
        let (f, _) = scripted(vec![Err(TransferError::Timeout)]);
        let mut buf = [0u8; 128];
        assert_eq!(read_chunked(&mut buf, 64, f), Err(TransferError::Timeout));
    }

    #[test]
    fn test_timeout_after_progress_keeps_progress() {
        let (f, _) = scripted(vec![Ok(64), Err(TransferError::Timeout)]);
        let mut buf = [0u8; 128];
        assert_eq!(read_chunked(&mut buf, 64, f), Ok(64));
    }

    #[test]
    fn test_failure_after_progress_keeps_progress() {
        let (f, _) = scripted(vec![Ok(64), Err(TransferError::Usb(rusb::Error::Pipe))]);
        let mut buf = [0u8; 256];
        assert_eq!(read_chunked(&mut buf, 64, f), Ok(64));
    }

    #[test]
    fn test_empty_buffer_reads_nothing() {
        let (f, requests) = scripted(vec![]);
        let mut buf = [0u8; 0];
        assert_eq!(read_chunked(&mut buf, 64, f), Ok(0));
        assert!(requests.borrow().is_empty());
    }

    #[test]
    fn test_zero_length_packet_ends_read() {
        let (f, _) = scripted(vec![Ok(0)]);
        let mut buf = [0u8; 64];
        assert_eq!(read_chunked(&mut buf, 64, f), Ok(0));
    }
}
