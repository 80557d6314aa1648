use int_enum::IntEnum;

/// Syscall numbers.
///
/// The gateway instruction and register conventions are architecture
/// specific; the numbers are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[repr(u16)]
pub enum Syscall {
    TaskGetId = 0,
    ThreadCreate = 1,
    ThreadExit = 2,
    AreaCreate = 3,
    AreaResize = 4,
    AreaDestroy = 5,
    FutexWait = 6,
    FutexWake = 7,
    IpcCall = 8,
    IpcAnswer = 9,
    DebugEnableConsole = 10,
}
