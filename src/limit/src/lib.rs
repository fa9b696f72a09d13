use utils::{bail_libc, SysResult};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Limit {
    pub cur: u64,
    pub max: u64,
}

impl Limit {
    pub const fn new(cur: u64, max: u64) -> Self {
        Self { cur, max }
    }

    pub fn is_infinite(&self) -> bool {
        self.cur == INFINITY
    }
}

/// The resource limits consulted by the memory manager. Unset limits read as
/// infinite.
#[derive(Clone, Copy, Debug)]
pub struct LimitSet {
    data: Option<Limit>,
    stack: Option<Limit>,
    memory_locked: Option<Limit>,
    address_space: Option<Limit>,
}

impl Default for LimitSet {
    fn default() -> Self {
        Self {
            data: None,
            stack: Some(Limit {
                cur: 0x800000,
                max: INFINITY,
            }),
            memory_locked: Some(Limit {
                cur: 64 << 10,
                max: 64 << 10,
            }),
            address_space: None,
        }
    }
}

pub const INFINITY: u64 = u64::MAX;

macro_rules! get_field {
    ($fn:ident, $field:ident) => {
        pub fn $fn(&self) -> Limit {
            self.$field.unwrap_or(Limit {
                cur: INFINITY,
                max: INFINITY,
            })
        }
    };
}

macro_rules! set_field {
    ($fn:ident, $field:ident) => {
        pub fn $fn(&mut self, v: Limit, privileged: bool) -> SysResult<Limit> {
            if v.cur > v.max {
                bail_libc!(libc::EINVAL);
            }
            let old = self.$field;
            if let Some(limit) = old {
                if limit.max < v.max && !privileged {
                    bail_libc!(libc::EPERM);
                }
            }
            self.$field = Some(v);
            Ok(old.unwrap_or(Limit {
                cur: INFINITY,
                max: INFINITY,
            }))
        }
    };
}

impl LimitSet {
    get_field!(get_data, data);
    get_field!(get_stack, stack);
    get_field!(get_memory_locked, memory_locked);
    get_field!(get_address_space, address_space);

    set_field!(set_data, data);
    set_field!(set_stack, stack);
    set_field!(set_memory_locked, memory_locked);
    set_field!(set_address_space, address_space);

    /// Limits with every resource unbounded.
    pub fn unlimited() -> Self {
        Self {
            data: None,
            stack: None,
            memory_locked: None,
            address_space: None,
        }
    }
}

pub trait Context {
    fn limits(&self) -> LimitSet;
}
