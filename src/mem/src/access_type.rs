#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AccessType {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl std::fmt::Debug for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { "r" } else { "-" },
            if self.write { "w" } else { "-" },
            if self.execute { "x" } else { "-" }
        )
    }
}

impl AccessType {
    pub const fn no_access() -> Self {
        Self {
            read: false,
            write: false,
            execute: false,
        }
    }

    pub const fn read() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    pub const fn read_execute() -> Self {
        Self {
            read: true,
            write: false,
            execute: true,
        }
    }

    pub const fn any_access() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
        }
    }

    // Hardware cannot express write-only or execute-only pages on the
    // platforms we model, so either implies read.
    pub fn effective(&self) -> AccessType {
        let mut ret = *self;
        if ret.write || ret.execute {
            ret.read = true;
        }
        ret
    }

    pub fn any(&self) -> bool {
        self.read || self.write || self.execute
    }

    pub fn as_prot(&self) -> i32 {
        let mut prot = 0;
        if self.read {
            prot |= libc::PROT_READ;
        }
        if self.write {
            prot |= libc::PROT_WRITE;
        }
        if self.execute {
            prot |= libc::PROT_EXEC;
        }
        prot
    }

    pub fn from_prot(prot: i32) -> Self {
        Self {
            read: prot & libc::PROT_READ != 0,
            write: prot & libc::PROT_WRITE != 0,
            execute: prot & libc::PROT_EXEC != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prot_conversion() {
        let rw = AccessType::from_prot(libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(rw, AccessType::read_write());
        assert_eq!(rw.as_prot(), libc::PROT_READ | libc::PROT_WRITE);
        assert!(!AccessType::from_prot(libc::PROT_NONE).any());
        assert_eq!(format!("{:?}", AccessType::read_execute()), "r-x");
        let wo = AccessType {
            write: true,
            ..AccessType::default()
        };
        assert_eq!(wo.effective(), AccessType::read_write());
    }
}
