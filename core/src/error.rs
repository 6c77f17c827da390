use thiserror::Error;

#[derive(Debug, Error)]
pub enum LodestoneError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device is busy or exclusively held: {0}")]
    DeviceLocked(String),

    #[error("Insufficient privileges: {0}")]
    InsufficientPrivileges(String),

    #[error("Filesystem corruption: {0}")]
    Corruption(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Volume is mounted read-only: {0}")]
    ReadOnly(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl LodestoneError {
    /// Wrap an `std::io::Error`, promoting the OS error codes that have a
    /// dedicated variant so callers can match on them.
    pub fn from_device_io(err: std::io::Error, what: &str) -> Self {
        match err.raw_os_error() {
            // EBUSY: another holder has the device open exclusively
            Some(16) => LodestoneError::DeviceLocked(format!("{}: {}", what, err)),
            // ENOENT / ENXIO / ENODEV: device vanished
            Some(2) | Some(6) | Some(19) => {
                LodestoneError::DeviceNotFound(format!("{}: {}", what, err))
            }
            _ => match err.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    LodestoneError::InsufficientPrivileges(format!("{}: {}", what, err))
                }
                std::io::ErrorKind::NotFound => {
                    LodestoneError::DeviceNotFound(format!("{}: {}", what, err))
                }
                _ => LodestoneError::IoError(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_errors_get_their_own_variant() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        match LodestoneError::from_device_io(io, "opening /dev/sdx") {
            LodestoneError::InsufficientPrivileges(msg) => assert!(msg.contains("/dev/sdx")),
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn busy_devices_report_locked() {
        let io = std::io::Error::from_raw_os_error(16);
        assert!(matches!(
            LodestoneError::from_device_io(io, "open"),
            LodestoneError::DeviceLocked(_)
        ));
    }

    #[test]
    fn missing_devices_report_not_found() {
        let io = std::io::Error::from_raw_os_error(19);
        assert!(matches!(
            LodestoneError::from_device_io(io, "open"),
            LodestoneError::DeviceNotFound(_)
        ));
    }
}
