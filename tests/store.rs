mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{block_on_runtime, start_server};
use pluvio_bridge::executor::spawn;
use pluvio_bridge::store::{
    self, attach, release_reply, AsyncClient, Command, Reply, ReplyLifecycle,
};
use pluvio_bridge::{BridgeError, ClientError};

#[derive(Default)]
struct CountingLifecycle {
    released: Cell<usize>,
}

impl ReplyLifecycle for CountingLifecycle {
    fn release(&self, _reply: Reply) {
        self.released.set(self.released.get() + 1);
    }
}

#[test]
fn set_then_get_from_two_workers() {
    let server = start_server();
    let value = block_on_runtime(async move {
        let attachment = Rc::new(store::connect("127.0.0.1", server.port).await.unwrap());

        let setter = spawn({
            let attachment = attachment.clone();
            async move { attachment.command("SET k v").await }
        })
        .unwrap();
        let set = setter.await.unwrap().unwrap();
        assert_eq!(set, Reply::Status("OK".into()));

        let getter = spawn({
            let attachment = attachment.clone();
            async move { attachment.command("GET k").await }
        })
        .unwrap();
        let got = getter.await.unwrap().unwrap();

        let attachment = Rc::try_unwrap(attachment).ok().unwrap();
        store::free(attachment).await;
        got
    });
    assert_eq!(value.as_str(), Some("v"));
}

#[test]
fn concurrent_commands_receive_their_own_replies() {
    const WORKERS: usize = 16;
    let server = start_server();
    let replies = block_on_runtime(async move {
        let attachment = Rc::new(store::connect("127.0.0.1", server.port).await.unwrap());

        let mut handles = Vec::new();
        for worker in 0..WORKERS {
            let attachment = attachment.clone();
            handles.push(
                spawn(async move {
                    let key = format!("key-{}", worker);
                    let value = format!("value-{}", worker);
                    attachment
                        .command(Command::new("SET").arg(key.clone()).arg(value))
                        .await?;
                    let echoed = attachment.command(Command::new("ECHO").arg(key.clone())).await?;
                    let got = attachment.command(Command::new("GET").arg(key)).await?;
                    Ok::<_, BridgeError>((worker, echoed, got))
                })
                .unwrap(),
            );
        }
        let mut replies = Vec::new();
        for handle in handles {
            replies.push(handle.await.unwrap().unwrap());
        }

        // Several commands from one task, in flight together.
        let joined = futures::future::join_all(
            (0..WORKERS).map(|w| attachment.command(Command::new("GET").arg(format!("key-{}", w)))),
        )
        .await;
        for (w, reply) in joined.into_iter().enumerate() {
            assert_eq!(
                reply.unwrap().as_str().map(str::to_owned),
                Some(format!("value-{}", w))
            );
        }

        let attachment = Rc::try_unwrap(attachment).ok().unwrap();
        store::free(attachment).await;
        replies
    });

    assert_eq!(replies.len(), WORKERS);
    for (worker, echoed, got) in replies {
        assert_eq!(echoed.as_str().map(str::to_owned), Some(format!("key-{}", worker)));
        assert_eq!(got.as_str().map(str::to_owned), Some(format!("value-{}", worker)));
    }
}

#[test]
fn second_attach_is_rejected_and_first_keeps_working() {
    let server = start_server();
    let (second_rejected, pong) = block_on_runtime(async move {
        let client = AsyncClient::connect("127.0.0.1", server.port).unwrap();
        let first = attach(&client).unwrap();
        let second_rejected = matches!(attach(&client), Err(BridgeError::AlreadyAttached));

        let pong = first.command("PING").await.unwrap();
        first.detach().await;
        client.free();
        (second_rejected, pong)
    });
    assert!(second_rejected);
    assert_eq!(pong, Reply::Status("PONG".into()));
}

#[test]
fn detach_restores_the_original_reply_lifecycle() {
    let server = start_server();
    let counts = block_on_runtime(async move {
        let client = AsyncClient::connect("127.0.0.1", server.port).unwrap();
        let counter = Rc::new(CountingLifecycle::default());
        client.set_reply_lifecycle(counter.clone());

        let attachment = attach(&client).unwrap();
        let reply = attachment.command("PING").await.unwrap();
        // The reply reached us instead of being released behind our back.
        let while_attached = counter.released.get();
        attachment.release(reply);
        let after_release = counter.released.get();

        attachment.detach().await;
        assert!(!client.has_event_hooks());
        client.reply_lifecycle().release(Reply::Nil);
        let after_detach = counter.released.get();

        client.free();
        (while_attached, after_release, after_detach)
    });
    assert_eq!(counts, (0, 1, 2));
}

#[test]
fn release_without_attachment_falls_back_to_default() {
    let server = start_server();
    let released = block_on_runtime(async move {
        release_reply(None, Reply::Status("loose".into()));

        let client = AsyncClient::connect("127.0.0.1", server.port).unwrap();
        let counter = Rc::new(CountingLifecycle::default());
        client.set_reply_lifecycle(counter.clone());
        let attachment = attach(&client).unwrap();
        let reply = attachment.command("ECHO hi").await.unwrap();
        release_reply(Some(&attachment), reply);
        store::free(attachment).await;
        counter.released.get()
    });
    assert_eq!(released, 1);
}

#[test]
fn server_closing_the_connection_fails_the_waiting_command() {
    let server = start_server();
    let (killed, after, last_error, client_gone) = block_on_runtime(async move {
        let attachment = store::connect("127.0.0.1", server.port).await.unwrap();
        let killed = attachment.command("KILL").await;
        let after = attachment.command("PING").await;
        let last_error = attachment.last_error();
        let client_gone = attachment.client().is_none();
        attachment.detach().await;
        (killed, after, last_error, client_gone)
    });
    assert!(matches!(killed, Err(BridgeError::Disconnected)));
    assert!(matches!(after, Err(BridgeError::Detached)));
    assert_eq!(last_error, Some(ClientError::Eof));
    assert!(client_gone);
}

#[test]
fn reattach_after_detach_keeps_the_connection() {
    let server = start_server();
    let (first, second) = block_on_runtime(async move {
        let client = AsyncClient::connect("127.0.0.1", server.port).unwrap();
        let attachment = attach(&client).unwrap();
        assert_eq!(attachment.host().as_deref(), Some("127.0.0.1"));
        assert_eq!(attachment.port(), Some(server.port));
        let first = attachment.command("INCR counter").await.unwrap();
        attachment.detach().await;
        assert!(!client.has_event_hooks());
        assert!(client.is_open());

        let attachment = attach(&client).unwrap();
        let second = attachment.command("INCR counter").await.unwrap();
        store::free(attachment).await;
        (first, second)
    });
    assert_eq!(first.as_integer(), Some(1));
    assert_eq!(second.as_integer(), Some(2));
}

#[test]
fn connect_to_a_closed_port_fails() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let failed = block_on_runtime(async move { store::connect("127.0.0.1", port).await.is_err() });
    assert!(failed);
}
