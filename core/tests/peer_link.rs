mod common;

use common::{eventually, PeerRegistry, TestClient, TestModem};
use modemsim_core::pdu::{Address, SmsPdu};

fn pair() -> (TestModem, TestClient, TestModem, TestClient) {
    let peers = PeerRegistry::default();
    let a = TestModem::start_peer(6520, &peers);
    let b = TestModem::start_peer(6521, &peers);
    let mut ril_a = a.ril();
    let mut ril_b = b.ril();
    a.register(&mut ril_a);
    b.register(&mut ril_b);
    ril_a.lines();
    ril_b.lines();
    (a, ril_a, b, ril_b)
}

#[test]
fn test_peer_call_setup_and_release() {
    let (a, mut ril_a, b, mut ril_b) = pair();

    assert_eq!(a.send(&mut ril_a, "ATD6521;"), vec!["OK"]);
    assert_eq!(
        a.send(&mut ril_a, "AT+CLCC"),
        vec!["+CLCC: 1,0,2,0,0,\"6521\",129", "OK"]
    );

    ril_b.wait_for("RING");
    assert_eq!(
        b.send(&mut ril_b, "AT+CLCC"),
        vec!["+CLCC: 1,1,4,0,0,\"6520\",129", "OK"]
    );

    assert_eq!(b.send(&mut ril_b, "ATA"), vec!["OK"]);
    eventually("caller sees the call answered", || {
        a.send(&mut ril_a, "AT+CLCC").first().map(String::as_str)
            == Some("+CLCC: 1,0,0,0,0,\"6521\",129")
    });

    assert_eq!(a.send(&mut ril_a, "AT+CHLD=11"), vec!["OK"]);
    assert_eq!(a.send(&mut ril_a, "AT+CLCC"), vec!["OK"]);
    eventually("callee drops the call", || b.modem.call().call_count() == 0);
    assert_eq!(b.send(&mut ril_b, "AT+CLCC"), vec!["OK"]);
}

#[test]
fn test_hold_and_swap_reach_peer() {
    let (a, mut ril_a, b, mut ril_b) = pair();

    assert_eq!(a.send(&mut ril_a, "ATD6521;"), vec!["OK"]);
    ril_b.wait_for("RING");
    assert_eq!(b.send(&mut ril_b, "ATA"), vec!["OK"]);
    eventually("caller sees the call answered", || {
        a.send(&mut ril_a, "AT+CLCC").first().map(String::as_str)
            == Some("+CLCC: 1,0,0,0,0,\"6521\",129")
    });

    assert_eq!(a.send(&mut ril_a, "AT+CHLD=2"), vec!["OK"]);
    eventually("callee sees the call held", || {
        b.send(&mut ril_b, "AT+CLCC")
            .iter()
            .any(|line| line == "+CLCC: 1,1,1,0,0,\"6520\",129")
    });

    // A second, local call becomes active while the peer call is held
    assert_eq!(a.send(&mut ril_a, "ATD5551234;"), vec!["OK"]);
    std::thread::sleep(std::time::Duration::from_millis(1300));

    assert_eq!(a.send(&mut ril_a, "AT+CHLD=2"), vec!["OK"]);
    assert_eq!(
        a.send(&mut ril_a, "AT+CLCC"),
        vec![
            "+CLCC: 1,0,0,0,0,\"6521\",129",
            "+CLCC: 2,0,1,0,0,\"5551234\",129",
            "OK"
        ]
    );
    eventually("callee sees the call resumed", || {
        b.send(&mut ril_b, "AT+CLCC")
            .iter()
            .any(|line| line == "+CLCC: 1,1,0,0,0,\"6520\",129")
    });
}

#[test]
fn test_callee_hangup_reaches_caller() {
    let (a, mut ril_a, b, mut ril_b) = pair();

    assert_eq!(a.send(&mut ril_a, "ATD6521;"), vec!["OK"]);
    ril_b.wait_for("RING");
    assert_eq!(b.send(&mut ril_b, "ATH"), vec!["OK"]);

    eventually("caller drops the call", || a.modem.call().call_count() == 0);
    assert_eq!(a.send(&mut ril_a, "AT+CLCC"), vec!["OK"]);
}

#[test]
fn test_dial_to_absent_peer() {
    let (a, mut ril_a, _b, _ril_b) = pair();
    assert_eq!(a.send(&mut ril_a, "ATD6599;"), vec!["NO CARRIER"]);
    assert_eq!(a.send(&mut ril_a, "AT+CLCC"), vec!["OK"]);
}

#[test]
fn test_own_port_is_a_local_call() {
    let (a, mut ril_a, _b, _ril_b) = pair();
    assert_eq!(a.send(&mut ril_a, "ATD15555216520;"), vec!["OK"]);
    assert_eq!(
        a.send(&mut ril_a, "AT+CLCC"),
        vec!["+CLCC: 1,0,2,0,0,\"15555216520\",129", "OK"]
    );
    eventually("local call answered", || {
        a.send(&mut ril_a, "AT+CLCC").first().map(String::as_str)
            == Some("+CLCC: 1,0,0,0,0,\"15555216520\",129")
    });
}

#[test]
fn test_second_incoming_call_waits() {
    let (a, mut ril_a, b, mut ril_b) = pair();
    assert_eq!(b.send(&mut ril_b, "ATD5551234;"), vec!["OK"]);

    assert_eq!(a.send(&mut ril_a, "ATD6521;"), vec!["OK"]);
    ril_b.wait_for("RING");
    let calls = b.send(&mut ril_b, "AT+CLCC");
    assert_eq!(calls[1], "+CLCC: 2,1,5,0,0,\"6520\",129");
}

#[test]
fn test_peer_sms_delivery() {
    let (a, mut ril_a, _b, mut ril_b) = pair();

    let submit = format!(
        "000100{}000005E8329BFD06",
        Address::from_number("15555216521").encode()
    );
    let length = submit.len() / 2 - 1;
    assert_eq!(a.send(&mut ril_a, &format!("AT+CMGS={}", length)), vec!["> "]);
    assert_eq!(a.send(&mut ril_a, &submit), vec!["+CMGS: 1", "OK"]);

    let deliver = ril_b.line_after("+CMT: 0");
    let pdu = SmsPdu::decode(&deliver).unwrap();
    assert_eq!(pdu.phone_number(), "15555216520");
    assert_eq!(pdu.user_data, "E8329BFD06");

    // Nothing loops back to the sender
    std::thread::sleep(std::time::Duration::from_millis(1300));
    assert!(ril_a.lines().iter().all(|line| !line.starts_with("+CMT")));
}

#[test]
fn test_radio_off_refuses_peer_call() {
    let (a, mut ril_a, b, mut ril_b) = pair();
    b.send(&mut ril_b, "AT+CFUN=0");

    assert_eq!(a.send(&mut ril_a, "ATD6521;"), vec!["OK"]);
    eventually("caller sees the refusal", || a.modem.call().call_count() == 0);
    assert_eq!(b.modem.call().call_count(), 0);
}
