use dualhid::{Mainloop, Result, Task, TickCallback, UsbHelper};
use std::cell::Cell;
use std::rc::Rc;
use std::{env, thread, time::Duration};

const TICK: Duration = Duration::from_millis(10);

/// Bare-bones host loop: tick callbacks every tick, delayed tasks by countdown.
#[derive(Default)]
struct SimpleMainloop {
    ticks: Vec<TickCallback>,
    tasks: Vec<(u32, Task)>,
}

impl SimpleMainloop {
    fn tick(&mut self) {
        let mut ticks = std::mem::take(&mut self.ticks);
        for tick in ticks.iter_mut() {
            tick(self);
        }
        ticks.append(&mut self.ticks);
        self.ticks = ticks;

        for (delay, task) in std::mem::take(&mut self.tasks) {
            if delay <= 1 {
                task(self);
            } else {
                self.tasks.push((delay - 1, task));
            }
        }
    }
}

impl Mainloop for SimpleMainloop {
    fn add_tick_callback(&mut self, callback: TickCallback) -> bool {
        self.ticks.push(callback);
        true
    }

    fn schedule(&mut self, ticks: u32, task: Task) -> bool {
        self.tasks.push((ticks, task));
        true
    }

    fn sleep_time(&self) -> Duration {
        TICK
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("Usage: poll_device <device path> [endpoint hex, default 81] [length, default 64]");
        eprintln!("  e.g. poll_device /win32/usb/1/a 81 8");
        eprintln!("       poll_device /sys/bus/usb/devices/1-2");
        eprintln!("       poll_device /hidapi/dev/hidraw0");
        return Ok(());
    };
    let endpoint = args
        .next()
        .and_then(|s| u8::from_str_radix(&s, 16).ok())
        .unwrap_or(0x81);
    let length = args.next().and_then(|s| s.parse().ok()).unwrap_or(64);

    let mut mainloop = SimpleMainloop::default();
    let helper = UsbHelper::init(&mut mainloop)?;

    println!("Opening {}...", path);
    let mut device = helper.open(&path)?;
    println!("Opened {:?}", device);

    let claimed = device.claim_interfaces_by(3, 0, 0);
    println!("Claimed {} HID interface(s)", claimed);

    let running = Rc::new(Cell::new(true));
    let flag = Rc::clone(&running);
    helper.start_read_loop(&device, &mut mainloop, endpoint, length, move |id, ep, data| {
        match data {
            Some(data) => println!("{} ep{}: {:02X?}", id, ep, data),
            None => {
                println!("{} ep{}: read loop ended", id, ep);
                flag.set(false);
            }
        }
    })?;

    println!("Reading endpoint {:02X} (Press Ctrl+C to stop)", endpoint);
    while running.get() {
        mainloop.tick();
        thread::sleep(mainloop.sleep_time());
    }

    device.close()?;
    helper.close();
    Ok(())
}
