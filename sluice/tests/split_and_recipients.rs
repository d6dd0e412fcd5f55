use sluice::{
    Exchange, Pipeline, RecipientList, Recipients, Route, Service, Splitter, header, processor,
    shared,
    aggregate::{BodyConcat, GroupedBody},
    testing::{MockEndpoint, MockResolver},
    tokenize,
};
use std::sync::Arc;

mod common;
use common::{init_tracing, runtime, text};

fn upper() -> sluice::SharedProcessor {
    processor(|ex| {
        let body = ex.body().to_text().to_uppercase();
        ex.set_body(body);
        Ok(())
    })
}

// ============================================================================
// Splitter
// ============================================================================

#[test]
fn test_parallel_split_keeps_piece_order() {
    init_tracing();
    let (_rt, executor) = runtime();
    let splitter = Splitter::splitter(tokenize(","), upper())
        .strategy(BodyConcat::new(","))
        .parallel_processing(true)
        .executor(executor)
        .build();
    splitter.start().unwrap();

    let ex = sluice::process_sync(&splitter, Exchange::new("a,b,c")).unwrap();
    assert_eq!(text(&ex), "A,B,C");
    assert_eq!(ex.properties().split_size, Some(3));
    assert_eq!(splitter.exchange_statistics().in_flight(), 0);
}

#[test]
fn test_split_without_strategy_keeps_original() {
    init_tracing();
    let splitter = Splitter::splitter(tokenize(","), upper()).build();
    let ex = sluice::process_sync(&splitter, Exchange::new("a,b,c")).unwrap();
    assert_eq!(text(&ex), "a,b,c");
}

#[test]
fn test_split_inside_route_groups_bodies() {
    init_tracing();
    let splitter = Splitter::splitter(tokenize(";"), upper())
        .strategy(GroupedBody)
        .build();
    let route = Route::new("split", shared(Pipeline::new(vec![shared(splitter)])));
    route.start().unwrap();

    let ex = route.send(Exchange::new("x;y")).unwrap();
    let bodies: Vec<String> = ex
        .body()
        .as_list()
        .unwrap()
        .iter()
        .map(|v| v.to_text())
        .collect();
    assert_eq!(bodies, vec!["X", "Y"]);
}

// ============================================================================
// Recipient List
// ============================================================================

#[test]
fn test_parallel_recipients_reuse_producers() {
    init_tracing();
    let (_rt, executor) = runtime();
    let a = Arc::new(MockEndpoint::new("mock:a"));
    let b = Arc::new(MockEndpoint::new("mock:b"));
    let resolver = Arc::new(MockResolver::new().with(a.clone()).with(b.clone()));
    let list = RecipientList::recipient_list(Recipients::new(header("to"), resolver))
        .parallel_processing(true)
        .executor(executor)
        .build();
    list.start().unwrap();

    for i in 0..4 {
        let ex = Exchange::new(format!("m{i}")).with_header("to", "mock:a,mock:b");
        let ex = sluice::process_sync(&list, ex).unwrap();
        assert!(!ex.is_failed());
    }
    assert_eq!(a.received().len(), 4);
    assert_eq!(b.received().len(), 4);
    assert_eq!(a.producers_created(), 1);
    assert_eq!(b.producers_created(), 1);
    assert_eq!(list.source().cache().statistics().in_use(), 0);
    assert_eq!(list.exchange_statistics().in_flight(), 0);
}

#[test]
fn test_failing_producer_fails_exchange() {
    init_tracing();
    let broken = Arc::new(MockEndpoint::failing("mock:broken"));
    let resolver = Arc::new(MockResolver::new().with(broken));
    let list = RecipientList::recipient_list(Recipients::new(header("to"), resolver)).build();

    let ex = Exchange::new("x").with_header("to", "mock:broken");
    let ex = sluice::process_sync(&list, ex).unwrap();
    assert!(ex.is_failed());
    assert_eq!(list.source().cache().statistics().in_use(), 0);
}
