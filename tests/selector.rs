mod common;

use std::io::Read;
use std::time::Duration;

use common::{MODULE, MockTransport, host, options, part_bytes, settings};
use mover_retrieval::retrieval::models::{ECAUTH_HOST, ECAUTH_USER};
use mover_retrieval::retrieval::{
    ErrorKind, HostCandidate, HostOptions, HostRole, RetrievalError, SourceDescriptor,
    SourceSelector, TransportRegistry,
};

fn selector(mock: &std::sync::Arc<MockTransport>) -> SourceSelector {
    let mut registry = TransportRegistry::new();
    registry.register(common::as_transport(mock));
    SourceSelector::with_options(registry, settings(), options(2, false))
}

fn read_all(stream: &mut impl Read) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn last_acquisition_host_is_accepted_whatever_its_size() {
    let mock = MockTransport::new();
    mock.put("a", "/in/f", part_bytes(0, 90));
    mock.put("c", "/in/f", part_bytes(2, 80));
    let candidates = vec![
        host("a"),
        host("b"),
        host("c").with_role(HostRole::Acquisition),
    ];
    let descriptor = SourceDescriptor::new(7, "/in/f", Some(100));

    let (mut stream, chosen) = selector(&mock).open(&descriptor, &candidates).unwrap();
    assert_eq!(chosen.name, "c");
    assert_eq!(read_all(&mut stream), part_bytes(2, 80));
    stream.close().unwrap();
    assert_eq!(mock.opens("a", "/in/f"), 0);
}

#[test]
fn exhausted_candidates_report_every_host_in_order() {
    let mock = MockTransport::new();
    mock.put("a", "/in/f", part_bytes(0, 90));
    let candidates = vec![host("a"), host("b")];
    let descriptor = SourceDescriptor::new(7, "/in/f", Some(100));

    let err = match selector(&mock).open(&descriptor, &candidates) {
        Err(e) => e,
        Ok(_) => panic!("no candidate should match"),
    };
    assert_eq!(err.kind(), ErrorKind::SourceNotAvailable);
    assert_eq!(err.attempted_hosts(), ["Host=a", "Host=b"]);
    let RetrievalError::SourceNotAvailable { message, failures, .. } = &err else {
        panic!("unexpected {err:?}");
    };
    assert!(message.starts_with("Not retrieved using Host=a, Host=b"));
    assert_eq!(failures.len(), 2);
    assert!(failures[0].cause.contains("Incorrect size (90 bytes)"));
    assert!(failures[1].cause.contains("No such file"));
}

#[test]
fn empty_candidate_list() {
    let mock = MockTransport::new();
    let descriptor = SourceDescriptor::new(1, "/in/f", Some(1));
    let err = selector(&mock).open(&descriptor, &[]).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::SourceNotAvailable);
    assert!(err.to_string().contains("(hosts list empty)"));
}

#[test]
fn generic_host_is_skipped_without_ecauth_values() {
    let mock = MockTransport::new();
    mock.put("b", "/in/f", part_bytes(1, 10));
    let generic = HostCandidate::new("portal", ECAUTH_HOST, MODULE).with_login(ECAUTH_USER);
    let descriptor = SourceDescriptor::new(1, "/in/f", Some(10));

    let (mut stream, chosen) = selector(&mock)
        .open(&descriptor, &[generic, host("b")])
        .unwrap();
    assert_eq!(chosen.name, "b");
    stream.close().unwrap();
    assert!(mock.requests().iter().all(|(h, _)| h == "b"));
}

#[test]
fn ecauth_values_are_substituted() {
    let mock = MockTransport::new();
    mock.put("node7", "/in/f", part_bytes(1, 10));
    let generic = HostCandidate::new("portal", ECAUTH_HOST, MODULE).with_login(ECAUTH_USER);
    let descriptor = SourceDescriptor::new(1, "/in/f", Some(10)).with_ecauth("alice", "node7");

    let (mut stream, chosen) = selector(&mock).open(&descriptor, &[generic]).unwrap();
    assert_eq!(chosen.host, "node7");
    assert_eq!(chosen.login, "alice");
    assert_eq!(stream.remote_host_name().as_deref(), Some("remote-node7"));
    assert_eq!(read_all(&mut stream), part_bytes(1, 10));
    stream.close().unwrap();
}

#[test]
fn backup_hosts_read_the_mover_path() {
    let mock = MockTransport::new();
    mock.put("m2", "/store/7", part_bytes(3, 40));
    let descriptor = SourceDescriptor::new(7, "/in/f", Some(40)).with_mover_path("/store/7");
    let backup = host("m2").with_role(HostRole::Backup);

    let (mut stream, _) = selector(&mock).open(&descriptor, &[backup]).unwrap();
    assert_eq!(read_all(&mut stream), part_bytes(3, 40));
    stream.close().unwrap();
}

#[test]
fn fifo_drops_the_host_list_option() {
    let mock = MockTransport::new();
    mock.put("a", "/in/fifo", part_bytes(0, 33));
    mock.probe_as("a", "/in/fifo", Some(0));
    let candidate = host("a").with_options(HostOptions {
        host_list: Some("x1,x2".to_string()),
        ..HostOptions::default()
    });
    let descriptor = SourceDescriptor::new(1, "/in/fifo", None);

    let (mut stream, chosen) = selector(&mock).open(&descriptor, &[candidate]).unwrap();
    assert_eq!(chosen.options.host_list, None);
    assert_eq!(read_all(&mut stream), part_bytes(0, 33));
    stream.close().unwrap();
}

#[test]
fn single_file_honours_start_offset() {
    let mock = MockTransport::new();
    mock.put("a", "/in/f", part_bytes(0, 100));
    let descriptor = SourceDescriptor::new(1, "/in/f", Some(100));

    let (mut stream, _) = selector(&mock)
        .open_at(&descriptor, &[host("a")], 40)
        .unwrap();
    assert_eq!(read_all(&mut stream), part_bytes(0, 100)[40..]);
    stream.close().unwrap();
}

fn seed_index(mock: &MockTransport, host: &str) -> Vec<u8> {
    let mut expected = Vec::new();
    for i in 0..3 {
        let data = part_bytes(i, 70 + i * 10);
        expected.extend_from_slice(&data);
        mock.put(host, &format!("/in/p{i}"), data);
    }
    mock.put(host, "/in/idx", "# parts\n/in/p0\n\n/in/p1  # second\n/in/p2\n");
    expected
}

#[test]
fn index_source_is_aggregated() {
    let mock = MockTransport::new();
    let expected = seed_index(&mock, "a");
    let descriptor = SourceDescriptor::new(1, "/in/idx", None).with_index(3);

    let (mut stream, _) = selector(&mock).open(&descriptor, &[host("a")]).unwrap();
    assert!(stream.is_multi_part());
    assert_eq!(stream.multi_part().map(|m| m.total_parts()), Some(3));
    assert_eq!(read_all(&mut stream), expected);
    stream.close().unwrap();
    stream.close().unwrap();
}

#[test]
fn index_count_mismatch_moves_to_next_host() {
    let mock = MockTransport::new();
    seed_index(&mock, "a");
    mock.put("a", "/in/idx", "/in/p0\n/in/p1\n");
    let expected = seed_index(&mock, "b");
    let descriptor = SourceDescriptor::new(1, "/in/idx", None).with_index(3);

    let (mut stream, chosen) = selector(&mock)
        .open(&descriptor, &[host("a"), host("b")])
        .unwrap();
    assert_eq!(chosen.name, "b");
    assert_eq!(read_all(&mut stream), expected);
    stream.close().unwrap();
}

#[test]
fn mget_hosts_expand_the_index_themselves() {
    let mock = MockTransport::new();
    let expected = seed_index(&mock, "a");
    let candidate = host("a").with_options(HostOptions {
        use_mget: true,
        ..HostOptions::default()
    });
    let descriptor = SourceDescriptor::new(1, "/in/idx", None).with_index(3);

    let (mut stream, _) = selector(&mock).open(&descriptor, &[candidate]).unwrap();
    assert!(!stream.is_multi_part());
    assert_eq!(read_all(&mut stream), expected);
    stream.close().unwrap();

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].1.expand_index);
}

#[test]
fn closing_before_reading_everything_releases_the_remote() {
    let mock = MockTransport::new();
    mock.put("a", "/in/big", part_bytes(0, 4096));
    let descriptor = SourceDescriptor::new(1, "/in/big", Some(4096));

    let (mut stream, _) = selector(&mock).open(&descriptor, &[host("a")]).unwrap();
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).unwrap();
    let _ = stream.close();
    assert!(stream.read(&mut head).is_err());
    assert!(mock.wait_idle(Duration::from_secs(5)));
}

#[test]
fn first_matching_host_wins_and_later_hosts_are_untouched() {
    let mock = MockTransport::new();
    mock.put("a", "/in/f", part_bytes(0, 500));
    mock.put("b", "/in/f", part_bytes(1, 1000));
    mock.put("c", "/in/f", part_bytes(2, 1000));
    let candidates = vec![host("a"), host("b"), host("c")];
    let descriptor = SourceDescriptor::new(9, "/in/f", Some(1000));

    let (mut stream, chosen) = selector(&mock).open(&descriptor, &candidates).unwrap();
    assert_eq!(chosen.name, "b");
    assert_eq!(stream.host().name, "b");
    let out = read_all(&mut stream);
    assert_eq!(out.len(), 1000);
    assert_eq!(out, part_bytes(1, 1000));
    stream.close().unwrap();

    assert_eq!(mock.opens("a", "/in/f"), 0);
    assert_eq!(mock.opens("b", "/in/f"), 1);
    assert_eq!(mock.opens("c", "/in/f"), 0);
}
