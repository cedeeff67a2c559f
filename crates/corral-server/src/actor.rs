use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{error, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

const ACTOR_CHANNEL_SIZE: usize = 8;

/// A single-threaded event loop with an owned mailbox.
/// All messages are processed sequentially, so the actor state needs no locks.
#[tonic::async_trait]
pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options: Send;

    fn name() -> &'static str;
    fn new(options: Self::Options) -> Self;
    async fn start(&mut self, ctx: &mut ActorContext<Self>);
    /// Process one message and return the next action.
    /// This method must not block; long-running or fallible work should be
    /// spawned via [ActorContext::spawn], with outcomes reported back
    /// as messages.
    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction;
    async fn stop(self, ctx: &mut ActorContext<Self>);
}

pub enum ActorAction {
    Continue,
    Stop,
}

pub struct ActorContext<T: Actor> {
    handle: ActorHandle<T>,
    /// Messages the actor sent to itself while processing a message.
    /// They are delivered in order, before anything else in the mailbox.
    queue: VecDeque<T::Message>,
    /// Tasks spawned by the actor when processing messages.
    /// Unfinished tasks are aborted when the context is dropped.
    tasks: JoinSet<()>,
}

impl<T: Actor> ActorContext<T> {
    fn new(handle: &ActorHandle<T>) -> Self {
        Self {
            handle: handle.clone(),
            queue: VecDeque::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    /// Enqueue a message for the actor itself.
    pub fn send(&mut self, message: T::Message) {
        self.queue.push_back(message);
    }

    /// Deliver a message to the actor after a delay.
    /// Delayed messages have no ordering guarantee relative to the mailbox.
    pub fn send_with_delay(&mut self, message: T::Message, delay: Duration) -> AbortHandle {
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            // The actor may have stopped while we slept.
            let _ = handle.send(message).await;
        })
    }

    /// Spawn a task and track it in the context.
    /// Tasks that expect to be handled on failure should send the actor
    /// a message; panics are only logged when reaped.
    pub fn spawn(&mut self, task: impl Future<Output = ()> + Send + 'static) -> AbortHandle {
        self.tasks.spawn(task)
    }

    /// Join tasks that have already completed and log panics.
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("{} task failed: {e}", T::name());
                }
            }
        }
    }

    /// Join the remaining tasks, giving each up to `deadline` to finish.
    /// Tasks that miss the deadline are abandoned.
    pub async fn join(&mut self, deadline: Duration) {
        loop {
            match tokio::time::timeout(deadline, self.tasks.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(e))) => {
                    if !e.is_cancelled() {
                        error!("{} task failed: {e}", T::name());
                    }
                }
                Err(_) => {
                    warn!(
                        "{} tasks did not finish within {deadline:?}; abandoning {} of them",
                        T::name(),
                        self.tasks.len()
                    );
                    break;
                }
            }
        }
    }

    fn next_queued(&mut self) -> Option<T::Message> {
        self.queue.pop_front()
    }
}

pub struct ActorHandle<T: Actor> {
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T: Actor> Clone for ActorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    fn new(options: T::Options) -> Self {
        let (tx, rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel::<bool>(false);
        let handle = Self {
            sender: tx,
            stopped: stopped_rx,
        };
        let runner = ActorRunner {
            actor: T::new(options),
            ctx: ActorContext::new(&handle),
            receiver: rx,
            stopped: stopped_tx,
        };
        // The actor runs detached; the event loop task stops by itself
        // when the stop action is taken.
        tokio::spawn(runner.run());
        handle
    }

    pub async fn send(
        &self,
        message: T::Message,
    ) -> Result<(), mpsc::error::SendError<T::Message>> {
        self.sender.send(message).await
    }

    pub async fn wait_for_stop(mut self) {
        // A receiver error means the sender was dropped,
        // which also means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

/// Owns the handles of spawned actors so that a server entrypoint
/// can block until all of them have stopped.
pub struct ActorSystem {
    waiters: Vec<BoxFuture<'static, ()>>,
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorSystem {
    pub fn new() -> Self {
        Self { waiters: vec![] }
    }

    pub fn spawn<T: Actor>(&mut self, options: T::Options) -> ActorHandle<T> {
        let handle = ActorHandle::<T>::new(options);
        self.waiters.push(Box::pin(handle.clone().wait_for_stop()));
        handle
    }

    pub async fn join(&mut self) {
        for waiter in self.waiters.drain(..) {
            waiter.await;
        }
    }
}

struct ActorRunner<T: Actor> {
    actor: T,
    ctx: ActorContext<T>,
    receiver: mpsc::Receiver<T::Message>,
    stopped: watch::Sender<bool>,
}

impl<T: Actor> ActorRunner<T> {
    async fn run(mut self) {
        self.actor.start(&mut self.ctx).await;
        'mailbox: while let Some(message) = self.receiver.recv().await {
            let mut message = message;
            loop {
                match self.actor.receive(&mut self.ctx, message) {
                    ActorAction::Continue => {}
                    ActorAction::Stop => break 'mailbox,
                }
                self.ctx.reap();
                match self.ctx.next_queued() {
                    Some(next) => message = next,
                    None => continue 'mailbox,
                }
            }
        }
        // Refuse new messages and drop whatever is still queued; any
        // reply channels inside them resolve with an error instead of
        // stalling callers while the actor shuts down.
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
        self.actor.stop(&mut self.ctx).await;
        let _ = self.stopped.send(true);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    struct TestActor {
        counter: u64,
    }

    enum TestMessage {
        Add {
            value: u64,
        },
        /// Split the value in two self-messages to exercise the internal queue.
        AddTwice {
            value: u64,
        },
        /// Schedule the addition through a delayed self-message.
        AddLater {
            value: u64,
        },
        Read {
            reply: oneshot::Sender<u64>,
        },
        Stop,
    }

    #[tonic::async_trait]
    impl Actor for TestActor {
        type Message = TestMessage;
        type Options = u64;

        fn name() -> &'static str {
            "TestActor"
        }

        fn new(options: u64) -> Self {
            Self { counter: options }
        }

        async fn start(&mut self, _: &mut ActorContext<Self>) {}

        fn receive(&mut self, ctx: &mut ActorContext<Self>, message: TestMessage) -> ActorAction {
            match message {
                TestMessage::Add { value } => {
                    self.counter += value;
                    ActorAction::Continue
                }
                TestMessage::AddTwice { value } => {
                    ctx.send(TestMessage::Add { value });
                    ctx.send(TestMessage::Add { value });
                    ActorAction::Continue
                }
                TestMessage::AddLater { value } => {
                    ctx.send_with_delay(
                        TestMessage::Add { value },
                        Duration::from_millis(10),
                    );
                    ActorAction::Continue
                }
                TestMessage::Read { reply } => {
                    let _ = reply.send(self.counter);
                    ActorAction::Continue
                }
                TestMessage::Stop => ActorAction::Stop,
            }
        }

        async fn stop(self, _: &mut ActorContext<Self>) {}
    }

    async fn read(handle: &ActorHandle<TestActor>) -> u64 {
        let (tx, rx) = oneshot::channel();
        handle
            .send(TestMessage::Read { reply: tx })
            .await
            .expect("actor should be running");
        rx.await.expect("actor should reply")
    }

    #[tokio::test]
    async fn test_actor_processes_messages_in_order() {
        let mut system = ActorSystem::new();
        let handle = system.spawn::<TestActor>(1);
        handle.send(TestMessage::Add { value: 2 }).await.unwrap();
        handle.send(TestMessage::AddTwice { value: 3 }).await.unwrap();
        assert_eq!(read(&handle).await, 9);
    }

    #[tokio::test]
    async fn test_actor_system_join_waits_for_stop() {
        let mut system = ActorSystem::new();
        let handle = system.spawn::<TestActor>(0);
        handle.send(TestMessage::Stop).await.unwrap();
        system.join().await;
        // The mailbox is closed once the actor has stopped.
        assert!(handle.send(TestMessage::Add { value: 1 }).await.is_err());
    }

    #[tokio::test]
    async fn test_delayed_message_is_delivered() {
        let mut system = ActorSystem::new();
        let handle = system.spawn::<TestActor>(0);
        handle
            .send(TestMessage::AddLater { value: 5 })
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if read(&handle).await == 5 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "the delayed message never arrived"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
