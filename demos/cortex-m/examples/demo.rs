#![no_std]
#![no_main]

use argon::{Queue, SchedulerConfig, ThreadConfig, Timeout, time};
use argon_cortex_m::{Stack, init_scheduler};
use log::info;
use panic_semihosting as _;
use static_cell::StaticCell;

static LOGGER: Logger = Logger;

static PRODUCER_STACK: StaticCell<Stack<8192>> = StaticCell::new();
static CONSUMER_STACK: StaticCell<Stack<8192>> = StaticCell::new();

static NUMBERS: Queue<u32, 8> = Queue::new("numbers");

#[cortex_m_rt::entry]
fn main() -> ! {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(log::LevelFilter::Info);

    info!("Started");

    let peripherals = cortex_m::Peripherals::take().unwrap();
    let scheduler = init_scheduler(
        peripherals.SYST,
        peripherals.SCB,
        168_000_000,
        SchedulerConfig::default().with_tick_freq(100),
    )
    .unwrap();

    let producer_stack = PRODUCER_STACK.init(Stack::new());
    let _producer = scheduler
        .spawn(
            || {
                let mut i = 0;
                loop {
                    NUMBERS.send(i, Timeout::Forever).unwrap();
                    i = (i + 1) % 10000;
                }
            },
            producer_stack,
            ThreadConfig::default().with_name("producer"),
        )
        .unwrap();

    let consumer_stack = CONSUMER_STACK.init(Stack::new());
    let _consumer = scheduler
        .spawn(
            || loop {
                let value = NUMBERS.receive(Timeout::Forever).unwrap();
                if value % 1000 == 0 {
                    info!("received {} at tick {}", value, time::current_time());
                }
            },
            consumer_stack,
            ThreadConfig::default().with_name("consumer"),
        )
        .unwrap();

    scheduler.start();
}

struct Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            cortex_m_semihosting::hprintln!("[{}] {}: {}", record.level(), record.target(), record.args())
        }
    }

    fn flush(&self) {}
}
