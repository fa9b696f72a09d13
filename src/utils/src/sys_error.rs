use std::fmt;

/// Coarse classification of a `SysError`. Callers that only care about the
/// failure category match on this instead of raw errno values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysErrorKind {
    InvalidArgument,
    PermissionDenied,
    OutOfMemory,
    NoDevice,
    TooManyMappings,
    Libc,
}

impl SysErrorKind {
    fn from_code(code: i32) -> Self {
        match code {
            libc::EINVAL => SysErrorKind::InvalidArgument,
            libc::EPERM | libc::EACCES | libc::EAGAIN => SysErrorKind::PermissionDenied,
            libc::ENOMEM => SysErrorKind::OutOfMemory,
            libc::ENODEV => SysErrorKind::NoDevice,
            _ => SysErrorKind::Libc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysError {
    code: i32,
    desc: Option<String>,
    kind: SysErrorKind,
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SysError occured with code: {} {:?} {:?}",
            self.code, self.desc, self.kind
        )
    }
}

impl std::error::Error for SysError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl SysError {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            desc: None,
            kind: SysErrorKind::from_code(code),
        }
    }

    pub fn new_with_msg(code: i32, msg: String) -> Self {
        Self {
            code,
            desc: Some(msg),
            kind: SysErrorKind::from_code(code),
        }
    }

    // The address space already holds the maximum number of regions. Reported
    // to userspace as ENOMEM, but kept distinguishable from a failed reservation.
    pub fn too_many_mappings() -> Self {
        Self {
            code: libc::ENOMEM,
            desc: Some("too many mappings".to_string()),
            kind: SysErrorKind::TooManyMappings,
        }
    }

    pub fn kind(&self) -> SysErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.code
    }
}

#[macro_export]
macro_rules! err_libc {
    ($libc_code:expr) => {
        Err($crate::SysError::new($libc_code))
    };
}

#[macro_export]
macro_rules! bail_libc {
    ($libc_code:expr) => {
        return Err($crate::SysError::new($libc_code))
    };
}

pub type SysResult<T> = std::result::Result<T, SysError>;
