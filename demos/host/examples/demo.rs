//! A producer feeding a queue attached to a run loop, which also drives a periodic
//! timer and reacts to a signal raised from interrupt context.

use argon::{
    Queue, RunLoop, SchedulerConfig, ThreadConfig, Timeout, Timer, TimerMode, time,
};
use argon_host::{Stack, init_logger, init_scheduler, raise_interrupt};
use argon_utils::delay::Delay;
use embedded_hal::delay::DelayNs;
use heapless::String;
use log::info;
use static_cell::StaticCell;

const TICK_FREQ: u32 = 100;

static PRODUCER_STACK: StaticCell<Stack<8192>> = StaticCell::new();
static DISPATCHER_STACK: StaticCell<Stack<8192>> = StaticCell::new();

static RUN_LOOP: RunLoop = RunLoop::new("main");
static READINGS: Queue<String<16>, 4> = Queue::new("readings");
static HEARTBEAT: Timer = Timer::new("heartbeat", TimerMode::Periodic, 50, &|timer: &Timer| {
    info!("heartbeat at {:?}", timer.wakeup_time());
});

fn main() {
    init_logger(log::LevelFilter::Info);

    let scheduler = init_scheduler(SchedulerConfig::default().with_tick_freq(TICK_FREQ))
        .expect("Failed to initialize the kernel");

    let producer_stack = PRODUCER_STACK.init(Stack::new());
    let _producer = scheduler
        .spawn(
            producer,
            producer_stack,
            ThreadConfig::default().with_name("producer").with_priority(1),
        )
        .unwrap();

    let dispatcher_stack = DISPATCHER_STACK.init(Stack::new());
    let _dispatcher = scheduler
        .spawn(
            dispatcher,
            dispatcher_stack,
            ThreadConfig::default().with_name("dispatcher").with_priority(2),
        )
        .unwrap();

    scheduler.start();
}

fn producer() {
    let mut delay = Delay::new().unwrap();

    for i in 0..10 {
        let mut reading = String::<16>::new();
        let _ = core::fmt::write(&mut reading, format_args!("reading {}", i));
        READINGS.send(reading, Timeout::Forever).unwrap();
        delay.delay_ms(200);
    }

    raise_interrupt(|| RUN_LOOP.signal(0b1)).unwrap();
}

fn dispatcher() {
    READINGS
        .attach(&RUN_LOOP, &|reading: String<16>| {
            info!("{} received at tick {}", reading, time::current_time());
        })
        .unwrap();
    RUN_LOOP.set_signal_handler(&|bits: u32| {
        info!("signal {:#b}, stopping", bits);
        let _ = RUN_LOOP.stop();
    });

    HEARTBEAT.attach(&RUN_LOOP).unwrap();
    HEARTBEAT.start().unwrap();

    RUN_LOOP.run().unwrap();
    info!("Run loop finished");
    std::process::exit(0);
}
