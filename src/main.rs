#![cfg_attr(target_arch = "aarch64", no_std)]
#![cfg_attr(target_arch = "aarch64", no_main)]

#[cfg(target_arch = "aarch64")]
#[unsafe(export_name = "main")]
extern "C" fn main() -> ! {
    kestrel::main()
}

#[cfg(target_arch = "aarch64")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    kestrel::panic_handler(info)
}

#[cfg(not(target_arch = "aarch64"))]
fn main() {}
