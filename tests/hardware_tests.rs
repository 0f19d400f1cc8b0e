// tests/hardware_tests.rs
//
// Set DUALHID_TEST_PATH to a discovery path of an attached HID device, e.g.
// `/win32/usb/1/a`, a sysfs directory or `/hidapi/dev/hidraw0`. Optional:
// DUALHID_TEST_ENDPOINT (hex, default 81) and DUALHID_TEST_REPORT (hex bytes
// of a feature request the device answers).
use dualhid::{HandleId, Mainloop, Result, Subsystem, Task, TickCallback, UsbHelper};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct TestMainloop {
    ticks: Vec<TickCallback>,
    tasks: Vec<(u32, Task)>,
}

impl TestMainloop {
    fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            let mut ticks = std::mem::take(&mut self.ticks);
            for tick in ticks.iter_mut() {
                tick(self);
            }
            ticks.append(&mut self.ticks);
            self.ticks = ticks;

            let tasks = std::mem::take(&mut self.tasks);
            for (delay, task) in tasks {
                if delay <= 1 {
                    task(self);
                } else {
                    self.tasks.push((delay - 1, task));
                }
            }
            std::thread::sleep(self.sleep_time());
        }
    }
}

impl Mainloop for TestMainloop {
    fn add_tick_callback(&mut self, callback: TickCallback) -> bool {
        self.ticks.push(callback);
        true
    }

    fn schedule(&mut self, ticks: u32, task: Task) -> bool {
        self.tasks.push((ticks, task));
        true
    }

    fn sleep_time(&self) -> Duration {
        Duration::from_millis(5)
    }
}

fn test_path() -> String {
    std::env::var("DUALHID_TEST_PATH").expect("DUALHID_TEST_PATH must name a connected device")
}

fn test_endpoint() -> u8 {
    std::env::var("DUALHID_TEST_ENDPOINT")
        .ok()
        .and_then(|s| u8::from_str_radix(&s, 16).ok())
        .unwrap_or(0x81)
}

#[test]
#[ignore] // Requires hardware
fn test_open_claim_close() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut mainloop = TestMainloop::default();
    let helper = UsbHelper::init(&mut mainloop)?;
    let mut device = helper.open(&test_path())?;
    println!("Opened {:?}", device);

    let claimed = device.claim_interfaces_by(3, 0, 0);
    println!("Claimed {} HID interface(s)", claimed);
    if device.subsystem() == Subsystem::Usb {
        assert!(claimed > 0, "a HID device should expose a class 3 interface");
    }

    device.close()?;
    assert!(device.close().is_err(), "second close must be reported");
    helper.close();
    Ok(())
}

#[test]
#[ignore] // Requires hardware
fn test_feature_request() -> Result<()> {
    let Ok(report) = std::env::var("DUALHID_TEST_REPORT") else {
        println!("Skipping: DUALHID_TEST_REPORT not set");
        return Ok(());
    };
    let request: Vec<u8> = report
        .split_whitespace()
        .map(|byte| u8::from_str_radix(byte, 16).expect("hex bytes"))
        .collect();

    let mut mainloop = TestMainloop::default();
    let helper = UsbHelper::init(&mut mainloop)?;
    let device = helper.open(&test_path())?;
    device.claim_interfaces_by(3, 0, 0);

    let index = u16::from(device.interface().unwrap_or(0));
    let response = device.hid_request(index, &request, request.len())?;
    println!("Response: {:02X?}", response);
    assert_eq!(response.len(), request.len());
    Ok(())
}

#[test]
#[ignore] // Requires hardware producing interrupt reports
fn test_read_loop_delivers_on_mainloop() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut mainloop = TestMainloop::default();
    let helper = UsbHelper::init(&mut mainloop)?;
    let device = helper.open(&test_path())?;
    device.claim_interfaces_by(3, 0, 0);

    let received: Rc<RefCell<Vec<(HandleId, u8, Option<usize>)>>> = Rc::default();
    let log = Rc::clone(&received);
    helper.start_read_loop(&device, &mut mainloop, test_endpoint(), 64, move |id, ep, data| {
        log.borrow_mut().push((id, ep, data.map(<[u8]>::len)));
    })?;

    println!("Interact with the device for a few seconds...");
    mainloop.run_for(Duration::from_secs(5));

    let received = received.borrow();
    println!("Received {} report(s)", received.len());
    for (id, ep, len) in received.iter() {
        assert_eq!(*id, device.id());
        assert_eq!(*ep, test_endpoint() & 0x7F);
        assert!(len.is_some(), "read loop ended while the device was attached");
    }
    Ok(())
}
