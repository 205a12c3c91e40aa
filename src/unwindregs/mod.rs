mod aarch64;
mod arm;
mod x86;
mod x86_64;

pub use aarch64::UnwindRegsAarch64;
pub use arm::UnwindRegsArm;
pub use x86::UnwindRegsX86;
pub use x86_64::UnwindRegsX86_64;
