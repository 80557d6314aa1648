use core::{fmt, ops::Deref};

use opal_abi::process::TASK_NAME_MAX;

/// An owned, bounded object name (tasks, threads).
#[derive(Clone, PartialEq, Eq)]
pub struct Name(heapless::String<TASK_NAME_MAX>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameTooLong;

impl Name {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Name {
    type Error = NameTooLong;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        heapless::String::try_from(value)
            .map(Self)
            .map_err(|_| NameTooLong)
    }
}

impl Deref for Name {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
