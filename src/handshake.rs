//! Device identification.
//!
//! Every supported variant answers the same init stage. After echoing it, the
//! device sends its signature byte followed by a fixed-length serial number.
//! No retries happen here; reconnect policy belongs to the caller.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::executor::{execute_stage, instantiate, ExecError, StageArgs};
use crate::link::{Connection, LinkError};
use crate::registry::{DeviceType, DeviceVariant, HANDSHAKE_COMMANDS, INIT_STAGE};

/// Response bytes examined for a signature before giving up.
pub const DETECTION_ATTEMPTS: usize = 15;

/// Read timeout used until the variant, and so its own timeout, is known.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(800);

#[derive(Debug, Error)]
pub enum DetectionError {
    /// Nothing recognizable answered.
    #[error("no supported device found after {attempts} response bytes")]
    Timeout {
        attempts: usize,
        /// Bytes that arrived but matched no registry entry.
        unrecognized: Vec<u8>,
    },
    /// Something answered, but not the way a healthy device does.
    #[error("device responded unexpectedly: {detail}")]
    Handshake {
        device_type: Option<DeviceType>,
        detail: String,
    },
    #[error("link failure during handshake: {0}")]
    Link(#[source] LinkError),
}

/// Runs the init stage on `conn` and resolves the attached variant.
pub fn detect(
    conn: &mut dyn Connection,
    attempts: usize,
    timeout: Duration,
) -> Result<DeviceVariant, DetectionError> {
    // The stage has no runtime parameters, so instantiation cannot fail.
    let init = instantiate(&HANDSHAKE_COMMANDS, &INIT_STAGE, &StageArgs::default()).map_err(
        |e| DetectionError::Handshake {
            device_type: None,
            detail: e.to_string(),
        },
    )?;

    match execute_stage(conn, &init, timeout) {
        Ok(_) => {}
        Err(ExecError::ConnectionLost {
            source: LinkError::Timeout,
            ..
        }) => {
            return Err(DetectionError::Timeout {
                attempts: 0,
                unrecognized: Vec::new(),
            })
        }
        Err(ExecError::ConnectionLost { source, .. }) => return Err(DetectionError::Link(source)),
        Err(e @ ExecError::EchoMismatch { .. }) => {
            return Err(DetectionError::Handshake {
                device_type: None,
                detail: format!("init stage: {e}"),
            })
        }
    }

    let mut unrecognized = Vec::new();
    for _ in 0..attempts {
        let byte = match conn.read_byte() {
            Ok(byte) => byte,
            Err(LinkError::Timeout) => continue,
            Err(e) => return Err(DetectionError::Link(e)),
        };
        match DeviceType::from_signature(byte) {
            Some(device_type) => return read_serial(conn, device_type),
            None => {
                // Could be an undiscovered variant; keep scanning.
                warn!(byte = format!("0x{byte:02X}"), "unrecognized handshake byte");
                unrecognized.push(byte);
            }
        }
    }

    Err(DetectionError::Timeout {
        attempts,
        unrecognized,
    })
}

fn read_serial(
    conn: &mut dyn Connection,
    device_type: DeviceType,
) -> Result<DeviceVariant, DetectionError> {
    let malformed = |detail: String| DetectionError::Handshake {
        device_type: Some(device_type),
        detail,
    };

    let len = device_type.profile().serial_len;
    let bytes = conn
        .read_bytes(len)
        .map_err(|e| malformed(format!("serial number read failed: {e}")))?;
    if !bytes.iter().all(u8::is_ascii_alphanumeric) {
        return Err(malformed(format!("serial number is not alphanumeric: {bytes:02X?}")));
    }
    let serial_number = String::from_utf8_lossy(&bytes).into_owned();

    info!(%device_type, %serial_number, "device detected");
    Ok(DeviceVariant {
        device_type,
        serial_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Faults, SimHandle, SimulatedDevice};

    fn detect_sim(device: SimulatedDevice) -> Result<DeviceVariant, DetectionError> {
        let handle = SimHandle::new(device);
        detect(&mut handle.link(), DETECTION_ATTEMPTS, HANDSHAKE_TIMEOUT)
    }

    #[test]
    fn resolves_every_registered_variant() {
        let serials = [
            (DeviceType::Mr72, "MR720001"),
            (DeviceType::Em272b, "EM2720B9"),
            (DeviceType::Em27, "E27001"),
            (DeviceType::Mr772, "MR77200042"),
        ];
        for (device_type, serial) in serials {
            let variant = detect_sim(SimulatedDevice::new(device_type, serial)).unwrap();
            assert_eq!(variant.device_type, device_type);
            assert_eq!(variant.serial_number, serial);
        }
    }

    #[test]
    fn unknown_signature_times_out_after_attempts() {
        let device = SimulatedDevice::new(DeviceType::Mr72, "12345678").with_faults(Faults {
            signature_override: Some(b'Z'),
            ..Faults::default()
        });
        let err = detect_sim(device).unwrap_err();
        let DetectionError::Timeout {
            attempts,
            unrecognized,
        } = err
        else {
            panic!("expected timeout, got {err:?}");
        };
        assert_eq!(attempts, 15);
        // 'Z' plus the eight serial digits; the remaining reads time out.
        assert_eq!(unrecognized, b"Z12345678".to_vec());
    }

    #[test]
    fn silent_port_is_a_timeout() {
        let device = SimulatedDevice::new(DeviceType::Mr72, "1").with_faults(Faults {
            silent_after: Some(0),
            ..Faults::default()
        });
        assert!(matches!(
            detect_sim(device),
            Err(DetectionError::Timeout { attempts: 0, .. })
        ));
    }

    #[test]
    fn garbled_init_echo_is_a_handshake_error() {
        let device = SimulatedDevice::new(DeviceType::Mr72, "1").with_faults(Faults {
            corrupt_echo_at: Some(0),
            ..Faults::default()
        });
        assert!(matches!(
            detect_sim(device),
            Err(DetectionError::Handshake {
                device_type: None,
                ..
            })
        ));
    }

    #[test]
    fn truncated_serial_is_a_handshake_error() {
        let handle = SimHandle::new(SimulatedDevice::new(DeviceType::Mr72, "1234"));
        let mut link = handle.link();
        // Eight serial digits from a device claiming to be an MR772, which sends ten.
        handle.set_faults(Faults {
            signature_override: Some(b'G'),
            ..Faults::default()
        });
        let err = detect(&mut link, DETECTION_ATTEMPTS, HANDSHAKE_TIMEOUT).unwrap_err();
        assert!(matches!(
            err,
            DetectionError::Handshake {
                device_type: Some(DeviceType::Mr772),
                ..
            }
        ));
    }

    #[test]
    fn non_alphanumeric_serial_is_a_handshake_error() {
        let mut device = SimulatedDevice::new(DeviceType::Em27, "AB");
        device.serial_number = "AB-12!".to_owned();
        assert!(matches!(
            detect_sim(device),
            Err(DetectionError::Handshake {
                device_type: Some(DeviceType::Em27),
                ..
            })
        ));
    }
}
