//! Test of the bounded queue: FIFO order, full/empty handling and blocking senders

mod panic_handler;
mod utils;

use argon::{
    Error, Queue, ThreadConfig, Timeout,
    portable_atomic::{AtomicU32, Ordering},
    scheduler::spawn,
    time,
};
use static_cell::ConstStaticCell;

use crate::utils::{Stack, check, exit_success, init_scheduler};

static SENDER_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());
static RECEIVER_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());

static QUEUE: Queue<u32, 4> = Queue::new("numbers");
static RECEIVED: AtomicU32 = AtomicU32::new(0);

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
    for value in 1..=4 {
        QUEUE.send(value, Timeout::NoWait).unwrap();
    }
    check(!QUEUE.is_empty(), "not empty");
    check(QUEUE.len() == 4, "four elements");
    check(QUEUE.send(5, Timeout::NoWait) == Err(Error::QueueFull), "full");

    spawn(
        receiver,
        RECEIVER_STACK.take(),
        ThreadConfig::default().with_name("receiver").with_priority(1),
    )
    .unwrap();

    // Blocks until the receiver takes the first element
    QUEUE.send(5, Timeout::Forever).unwrap();
    check(QUEUE.len() == 4, "pending element was buffered");

    for expected in 2..=5 {
        check(QUEUE.receive(Timeout::NoWait) == Ok(expected), "FIFO order");
    }
    check(QUEUE.receive(Timeout::NoWait) == Err(Error::QueueEmpty), "empty");

    let start = time::current_time();
    check(QUEUE.receive(Timeout::Ticks(2)) == Err(Error::Timeout), "receive timed out");
    check(time::current_time() - start >= 2, "waited for the timeout");

    // The receiver hands over directly to this blocked thread
    check(QUEUE.receive(Timeout::Forever) == Ok(42), "direct handoff");
    check(RECEIVED.load(Ordering::Acquire) == 1, "receiver got the oldest element");
    check(QUEUE.is_empty(), "handoff bypassed the buffer");

    exit_success();
}

fn receiver() {
    let value = QUEUE.receive(Timeout::Forever).unwrap();
    RECEIVED.store(value, Ordering::Release);

    // Outlasts the timed receive of the sender, then hands over to its untimed one
    time::sleep(5).unwrap();
    QUEUE.send(42, Timeout::NoWait).unwrap();
}
