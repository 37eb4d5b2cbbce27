//! kestrel-boot entry point.
//!
//! Reached from the 16-bit loader stub in real mode, image below 640 KiB,
//! interrupts as the host left them. Runs the bootstrap sequence and
//! reports over serial; the kernel handoff picks up from the pool and
//! the live transition layer.
#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot_entry {
    use core::panic::PanicInfo;

    use spin::Mutex;

    use kestrel_boot::arch::x86::{self, bus::PcBus, serial};
    use kestrel_boot::mode::BackendKind;
    use kestrel_boot::sequencer::{BootReport, Bootstrap, Handoff};
    use kestrel_boot::serial_println;

    // The descriptor tables and pool live here for the machine's
    // lifetime; their linear addresses go into GDTR/IDTR.
    static BOOTSTRAP: Mutex<Bootstrap> = Mutex::new(Bootstrap::new(Handoff::Dos));

    #[no_mangle]
    pub extern "C" fn bmain() -> ! {
        serial::SERIAL.lock().init();
        serial_println!("kestrel-boot v0.1.0 - cold start");

        let mut bus = PcBus::new();
        let mut boot = BOOTSTRAP.lock();

        match boot.run(&mut bus) {
            Ok(report) => log_report(&report),
            Err(e) => {
                serial_println!("[boot] bootstrap failed: {}", e);
                if let Err(e) = boot.shutdown(&mut bus) {
                    serial_println!("[boot] rollback incomplete: {}", e);
                }
            }
        }

        loop {
            x86::hlt();
        }
    }

    fn log_report(report: &BootReport) {
        match report.backend {
            BackendKind::Raw => serial_println!("[mode] raw backend (no host)"),
            BackendKind::Vcpi => {
                if let Some((major, minor)) = report.vcpi_version {
                    serial_println!("[mode] VCPI backend, host v{}.{}", major, minor);
                }
                if let Some(w) = report.irq_window {
                    serial_println!(
                        "[irq] vector window: master {:#04x}, slave {:#04x}",
                        w.master_base,
                        w.slave_base
                    );
                }
            }
        }
        if report.dpmi_host_seen {
            serial_println!("[mode] resident DPMI host detected (unused)");
        }
        serial_println!(
            "[mem] {} KiB conventional, {} KiB total, top {:#x} ({:?})",
            report.conventional_bytes / 1024,
            report.total_bytes / 1024,
            report.max_address,
            report.extended_source
        );
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        serial_println!("!!! BOOT PANIC !!!");
        serial_println!("{}", info);
        loop {
            x86::hlt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
