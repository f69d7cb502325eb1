use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Invalid group size dimension")]
    InvalidGroupSizeDimension,

    #[error("Out of virtual address space")]
    OutOfVirtualAddressSpace,

    #[error("Out of device memory")]
    OutOfDeviceMemory,

    #[error("Out of host memory")]
    OutOfHostMemory,

    #[error("Not ready")]
    NotReady,

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Module build failed:\n{log}")]
    ModuleBuildFailure { log: String },

    #[error("Device lost")]
    DeviceLost,
}

// Numeric `ze_result_t` values.
pub const ZE_RESULT_SUCCESS: u32 = 0;
pub const ZE_RESULT_NOT_READY: u32 = 1;
pub const ZE_RESULT_ERROR_DEVICE_LOST: u32 = 0x7000_0001;
pub const ZE_RESULT_ERROR_OUT_OF_HOST_MEMORY: u32 = 0x7000_0002;
pub const ZE_RESULT_ERROR_OUT_OF_DEVICE_MEMORY: u32 = 0x7000_0003;
pub const ZE_RESULT_ERROR_MODULE_BUILD_FAILURE: u32 = 0x7000_0004;
pub const ZE_RESULT_ERROR_UNSUPPORTED_FEATURE: u32 = 0x7800_0003;
pub const ZE_RESULT_ERROR_INVALID_ARGUMENT: u32 = 0x7800_0004;
pub const ZE_RESULT_ERROR_INVALID_SIZE: u32 = 0x7800_0008;
pub const ZE_RESULT_ERROR_INVALID_GROUP_SIZE_DIMENSION: u32 = 0x7800_0013;

impl ZeError {
    /// The `ze_result_t` code a C caller would observe for this error.
    ///
    /// `InvalidState` has no dedicated code and is reported as `NOT_READY`.
    /// Running out of virtual address space is reported as out of device memory.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::InvalidArgument(_) => ZE_RESULT_ERROR_INVALID_ARGUMENT,
            Self::InvalidState(_) | Self::NotReady => ZE_RESULT_NOT_READY,
            Self::InvalidSize(_) => ZE_RESULT_ERROR_INVALID_SIZE,
            Self::InvalidGroupSizeDimension => ZE_RESULT_ERROR_INVALID_GROUP_SIZE_DIMENSION,
            Self::OutOfVirtualAddressSpace | Self::OutOfDeviceMemory => {
                ZE_RESULT_ERROR_OUT_OF_DEVICE_MEMORY
            }
            Self::OutOfHostMemory => ZE_RESULT_ERROR_OUT_OF_HOST_MEMORY,
            Self::UnsupportedFeature(_) => ZE_RESULT_ERROR_UNSUPPORTED_FEATURE,
            Self::ModuleBuildFailure { .. } => ZE_RESULT_ERROR_MODULE_BUILD_FAILURE,
            Self::DeviceLost => ZE_RESULT_ERROR_DEVICE_LOST,
        }
    }

    pub(crate) fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Collapses a result into its `ze_result_t` code.
#[must_use]
pub fn result_code<T>(result: &ZeResult<T>) -> u32 {
    match result {
        Ok(_) => ZE_RESULT_SUCCESS,
        Err(e) => e.code(),
    }
}

// A convenient alias
pub type ZeResult<T> = Result<T, ZeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_is_reported_as_not_ready() {
        let err = ZeError::invalid_state("append after close");
        assert_eq!(err.code(), ZE_RESULT_NOT_READY);
        assert_eq!(result_code::<()>(&Err(err)), ZE_RESULT_NOT_READY);
    }

    #[test]
    fn success_maps_to_zero() {
        assert_eq!(result_code(&Ok::<u32, ZeError>(7)), ZE_RESULT_SUCCESS);
        assert_eq!(ZeError::DeviceLost.code(), ZE_RESULT_ERROR_DEVICE_LOST);
    }
}
