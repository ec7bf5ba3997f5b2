//! Dialog identity, forking, CSeq policing and in-dialog routing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Event, MockChannel, RecordingListener};
use signaling_core::{
    DialogId, DialogState, EngineConfig, EventSet, MainLoop, Message, Method, Provider, Request,
    Response, StatusCode,
};

fn engine() -> (MainLoop, Arc<RecordingListener>, Provider) {
    let main_loop = MainLoop::new();
    let listener = RecordingListener::new();
    let provider = Provider::new(main_loop.clone(), listener.clone(), EngineConfig::default());
    (main_loop, listener, provider)
}

#[tokio::test(start_paused = true)]
async fn forked_provisionals_create_parallel_early_dialogs() {
    let (main_loop, listener, provider) = engine();
    let channel = MockChannel::udp();
    let source = provider.attach_channel(channel.clone());

    let invite = common::invite("z9hG4bKfork");
    let key = provider
        .send_request(invite.clone(), channel.clone())
        .unwrap();

    // Two forks answer with different To tags.
    channel.push_incoming(Message::Response(common::tagged_response(
        &invite, 180, "callee-a",
    )));
    channel.push_incoming(Message::Response(common::tagged_response(
        &invite, 180, "callee-b",
    )));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;

    let dialog_a = DialogId::new("call-1", "alice-tag", "callee-a");
    let dialog_b = DialogId::new("call-1", "alice-tag", "callee-b");
    assert_eq!(listener.count(|e| matches!(e, Event::DialogCreated(_))), 2);
    assert_eq!(provider.dialog_state(&dialog_a), Some(DialogState::Early));
    assert_eq!(provider.dialog_state(&dialog_b), Some(DialogState::Early));

    // Fork A wins: its early dialog is confirmed, B stays early until the
    // application tears it down.
    channel.push_incoming(Message::Response(common::tagged_response(
        &invite, 200, "callee-a",
    )));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;

    assert_eq!(
        listener.count(|e| matches!(e, Event::DialogConfirmed(d) if *d == dialog_a)),
        1
    );
    assert_eq!(provider.dialog_state(&dialog_a), Some(DialogState::Confirmed));
    assert_eq!(provider.dialog_state(&dialog_b), Some(DialogState::Early));
    // The 2xx also ended the INVITE client transaction.
    assert!(provider.transaction_state(&key).is_none());

    provider.terminate_dialog(&dialog_b).unwrap();
    assert_eq!(provider.dialog_state(&dialog_b), None);
    assert_eq!(
        listener.count(|e| matches!(e, Event::DialogTerminated(d) if *d == dialog_b)),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn in_dialog_bye_reuses_route_set_and_ends_the_dialog() {
    let (main_loop, listener, provider) = engine();
    let channel = MockChannel::udp();
    let source = provider.attach_channel(channel.clone());

    let invite = common::invite("z9hG4bKbye");
    provider
        .send_request(invite.clone(), channel.clone())
        .unwrap();

    // Record-Route arrives on the dialog-creating response; the route set
    // freezes then, reversed for the client side.
    let mut ringing = common::tagged_response(&invite, 180, "bob-tag");
    ringing.headers.record_route =
        vec!["sip:p2.example.com;lr".into(), "sip:p1.example.com;lr".into()];
    ringing.headers.contact = Some("sip:bob@192.0.2.7".into());
    channel.push_incoming(Message::Response(ringing));
    let mut ok = common::tagged_response(&invite, 200, "bob-tag");
    ok.headers.contact = Some("sip:bob@192.0.2.7".into());
    channel.push_incoming(Message::Response(ok));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;

    let dialog = DialogId::new("call-1", "alice-tag", "bob-tag");
    assert_eq!(provider.dialog_state(&dialog), Some(DialogState::Confirmed));

    let bye = provider
        .create_in_dialog_request(&dialog, Method::Bye)
        .unwrap();
    assert_eq!(bye.headers.cseq.seq, 2);
    assert_eq!(bye.uri, "sip:bob@192.0.2.7");
    assert_eq!(
        bye.headers.route,
        vec!["sip:p1.example.com;lr".to_string(), "sip:p2.example.com;lr".to_string()]
    );
    assert_eq!(bye.from_tag(), Some("alice-tag"));
    assert_eq!(bye.to_tag(), Some("bob-tag"));

    let bye_key = provider.send_request(bye.clone(), channel.clone()).unwrap();
    channel.push_incoming(Message::Response(Response::for_request(
        &bye,
        StatusCode::OK,
    )));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;

    // One 200 for the INVITE, one for the BYE.
    assert_eq!(listener.count(|e| matches!(e, Event::Final(_, 200))), 2);
    assert_eq!(
        listener.count(|e| matches!(e, Event::DialogTerminated(d) if *d == dialog)),
        1
    );
    assert_eq!(provider.dialog_state(&dialog), None);
    // BYE transaction itself lingers in Completed for timer K.
    assert!(provider.transaction_state(&bye_key).is_some());
}

fn in_dialog_request(method: Method, branch: &str, cseq: u32) -> Request {
    let mut request = common::request(method, branch, "call-1", cseq);
    request.headers.to_tag = Some("bob-tag".to_string());
    request
}

#[tokio::test(start_paused = true)]
async fn server_side_routing_polices_cseq_and_unknown_dialogs() {
    let (main_loop, listener, provider) = engine();
    let channel = MockChannel::udp();
    let source = provider.attach_channel(channel.clone());

    // Establish the dialog as UAS.
    let invite = common::invite("z9hG4bKuas");
    channel.push_incoming(Message::Request(invite.clone()));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;
    let invite_key = listener
        .events()
        .iter()
        .find_map(|e| match e {
            Event::NewServerTransaction(key, Method::Invite, None) => Some(key.clone()),
            _ => None,
        })
        .expect("INVITE surfaced");
    provider
        .send_response(&invite_key, common::tagged_response(&invite, 200, "bob-tag"))
        .unwrap();

    let dialog = DialogId::new("call-1", "bob-tag", "alice-tag");
    assert_eq!(provider.dialog_state(&dialog), Some(DialogState::Confirmed));
    assert_eq!(
        listener.count(|e| matches!(e, Event::DialogConfirmed(d) if *d == dialog)),
        1
    );

    // ACK for the 2xx carries a fresh branch: no transaction, routed to
    // the dialog.
    let ack = in_dialog_request(Method::Ack, "z9hG4bKack", 1);
    channel.push_incoming(Message::Request(ack.clone()));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;
    assert_eq!(
        listener.count(|e| matches!(e, Event::InDialogRequest(d, Method::Ack) if *d == dialog)),
        1
    );

    // In-dialog BYE becomes a server transaction bound to the dialog.
    let bye = in_dialog_request(Method::Bye, "z9hG4bKb2", 2);
    channel.push_incoming(Message::Request(bye.clone()));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;
    let bye_key = listener
        .events()
        .iter()
        .find_map(|e| match e {
            Event::NewServerTransaction(key, Method::Bye, Some(d)) if *d == dialog => {
                Some(key.clone())
            }
            _ => None,
        })
        .expect("BYE surfaced with its dialog");

    // Out-of-order request (CSeq below the BYE's): rejected with 500,
    // dialog untouched.
    let stale = in_dialog_request(Method::Info, "z9hG4bKstale", 1);
    channel.push_incoming(Message::Request(stale));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;
    match channel.last_sent().unwrap() {
        Message::Response(response) => assert_eq!(response.status.as_u16(), 500),
        other => panic!("expected 500, got {other}"),
    }
    assert_eq!(
        listener.count(|e| matches!(e, Event::NewServerTransaction(_, _, _))),
        2
    );
    assert_eq!(provider.dialog_state(&dialog), Some(DialogState::Confirmed));

    // Answering the BYE ends the dialog.
    provider
        .send_response(&bye_key, common::tagged_response(&bye, 200, "bob-tag"))
        .unwrap();
    assert_eq!(provider.dialog_state(&dialog), None);
    assert_eq!(
        listener.count(|e| matches!(e, Event::DialogTerminated(d) if *d == dialog)),
        1
    );

    // The dialog is gone: further in-dialog requests get 481.
    let late = in_dialog_request(Method::Info, "z9hG4bKlate", 3);
    channel.push_incoming(Message::Request(late));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;
    match channel.last_sent().unwrap() {
        Message::Response(response) => assert_eq!(response.status.as_u16(), 481),
        other => panic!("expected 481, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn dialog_events_arrive_before_the_response_report() {
    let (main_loop, listener, provider) = engine();
    let channel = MockChannel::udp();
    let source = provider.attach_channel(channel.clone());

    let invite = common::invite("z9hG4bKorder");
    provider
        .send_request(invite.clone(), channel.clone())
        .unwrap();
    channel.push_incoming(Message::Response(common::tagged_response(
        &invite, 180, "bob-tag",
    )));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;

    let events = listener.events();
    let created = events
        .iter()
        .position(|e| matches!(e, Event::DialogCreated(_)))
        .expect("dialog created");
    let provisional = events
        .iter()
        .position(|e| matches!(e, Event::Provisional(_, 180)))
        .expect("provisional reported");
    assert!(created < provisional);
}

#[tokio::test(start_paused = true)]
async fn non_dialog_methods_do_not_create_dialogs() {
    let (main_loop, listener, provider) = engine();
    let channel = MockChannel::udp();
    let source = provider.attach_channel(channel.clone());

    let options = common::request(Method::Options, "z9hG4bKo", "call-o", 1);
    provider
        .send_request(options.clone(), channel.clone())
        .unwrap();
    channel.push_incoming(Message::Response(common::tagged_response(
        &options, 200, "bob-tag",
    )));
    main_loop.mark_ready(source, EventSet::READ).unwrap();
    main_loop.run_for(Duration::from_millis(1)).await;

    assert_eq!(listener.count(|e| matches!(e, Event::DialogCreated(_))), 0);
    assert!(provider.dialog_ids().is_empty());
    assert_eq!(listener.count(|e| matches!(e, Event::Final(_, 200))), 1);
}
