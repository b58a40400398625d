//! Test of rendezvous transfers over an unbuffered channel

mod panic_handler;
mod utils;

use core::cell::RefCell;

use argon::{Channel, Error, ThreadConfig, Timeout, scheduler::spawn, time};
use heapless::Vec;
use static_cell::ConstStaticCell;

use crate::utils::{Stack, check, exit_failure, exit_success, init_scheduler};

static SENDER_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static RECEIVER_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());

static CHANNEL: Channel<[u8; 4]> = Channel::new("bytes");

static RECEIVED: critical_section::Mutex<RefCell<Vec<[u8; 4], 4>>> =
    critical_section::Mutex::new(RefCell::new(Vec::new()));

fn main() {
    panic_handler::install();
    let scheduler = init_scheduler(100).expect("Failed to initialize the kernel");

    let _sender = spawn(
        sender,
        SENDER_STACK.take(),
        ThreadConfig::default().with_name("sender").with_priority(2),
    )
    .unwrap();

    scheduler.start();
}

fn sender() {
    check(
        CHANNEL.send([0; 4], Timeout::NoWait) == Err(Error::WouldBlock),
        "no receiver yet",
    );

    spawn(
        receiver,
        RECEIVER_STACK.take(),
        ThreadConfig::default().with_name("receiver").with_priority(1),
    )
    .unwrap();

    // Each send returns only once the receiver has taken the value
    CHANNEL.send([1, 2, 3, 4], Timeout::Forever).unwrap();
    CHANNEL.send([5, 6, 7, 8], Timeout::Ticks(10)).unwrap();
    check(received_count() == 1, "receiver is still processing the second value");

    let start = time::current_time();
    check(CHANNEL.receive(Timeout::Ticks(2)) == Err(Error::Timeout), "receive timed out");
    check(time::current_time() - start >= 2, "waited for the timeout");

    check(CHANNEL.receive(Timeout::Forever) == Ok([9, 9, 9, 9]), "value from the receiver");
    critical_section::with(|cs| {
        let received = RECEIVED.borrow_ref(cs);
        if received[..] != [[1, 2, 3, 4], [5, 6, 7, 8]] {
            eprintln!("{:?}", received);
            exit_failure("wrong values received");
        }
    });

    exit_success();
}

fn receiver() {
    for _ in 0..2 {
        let value = CHANNEL.receive(Timeout::Forever).unwrap();
        critical_section::with(|cs| RECEIVED.borrow_ref_mut(cs).push(value).unwrap());
    }

    time::sleep(5).unwrap();
    CHANNEL.send([9; 4], Timeout::Forever).unwrap();
}

fn received_count() -> usize {
    critical_section::with(|cs| RECEIVED.borrow_ref(cs).len())
}
