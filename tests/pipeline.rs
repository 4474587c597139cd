//! End-to-end pipeline tests
//!
//! Full configurations compiled from YAML and driven through the
//! six-phase engine against in-memory messages.
//!
//! Run with: cargo test --test pipeline

use sbiflt::lookup::MemoryLookupService;
use sbiflt::{
    Body, Engine, Exchange, ExchangeOutcome, HeaderMap, LookupService, MemoryBody,
    MemoryHeaderMap, NetworkOrigin, ProxyConfig, RootConfig, RunState,
};
use serde_json::json;

fn engine(yaml: &str) -> Engine {
    let config = ProxyConfig::from_yaml(yaml).expect("config parses");
    Engine::new(RootConfig::from_config(&config).expect("config compiles"))
}

struct Message {
    req: MemoryHeaderMap,
    resp: MemoryHeaderMap,
    req_body: MemoryBody,
    resp_body: MemoryBody,
}

impl Message {
    fn get(path: &str) -> Self {
        let mut req = MemoryHeaderMap::new();
        req.set(":method", "GET");
        req.set(":path", path);
        Self {
            req,
            resp: MemoryHeaderMap::new(),
            req_body: MemoryBody::empty(),
            resp_body: MemoryBody::empty(),
        }
    }

    fn exchange(&mut self) -> Exchange<'_> {
        Exchange {
            request_headers: &mut self.req,
            response_headers: &mut self.resp,
            request_body: &mut self.req_body,
            response_body: &mut self.resp_body,
        }
    }
}

#[test]
fn mcc_mnc_screening_from_path() {
    let engine = engine(
        r#"
filter_cases:
  - name: sc_plmn
    filter_data:
      - name: plmn_from_path
        source: path
        extractor_regex: "mcc(?P<mcc>\\d{3})-mnc(?P<mnc>\\d{2,3})"
    filter_rules:
      - name: home_plmn
        condition:
          op_and:
            args:
              - op_equals:
                  left:
                    term_var: mcc
                  right:
                    term_string: "262"
              - op_equals:
                  left:
                    term_var: mnc
                  right:
                    term_string: "01"
        actions:
          - add_header:
              name: x-plmn
              value:
                term_string: home
      - name: other_plmn
        condition:
          op_not:
            arg:
              op_equals:
                left:
                  term_var: mcc
                right:
                  term_string: "262"
        actions:
          - reject_message:
              status: 403
              title: Unknown PLMN
filter_phases:
  in_request_screening:
    own_network: [sc_plmn]
"#,
    );

    let root = engine.root();
    let mut run = RunState::new(root, NetworkOrigin::Internal, None);
    let mut msg = Message::get("/namf-comm/v1/mcc262-mnc01/ue-contexts");
    let mut exchange = msg.exchange();
    let outcome = engine.process_request(&mut run, &mut exchange);
    assert!(matches!(outcome, ExchangeOutcome::Continue));
    drop(exchange);
    assert_eq!(msg.req.get("x-plmn"), vec!["home"]);

    let mut run = RunState::new(root, NetworkOrigin::Internal, None);
    let mut msg = Message::get("/namf-comm/v1/mcc460-mnc00/ue-contexts");
    let mut exchange = msg.exchange();
    match engine.process_request(&mut run, &mut exchange) {
        ExchangeOutcome::LocalReply(Some(reply)) => assert_eq!(reply.status, 403),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn forwarded_for_subnet_any_match() {
    let engine = engine(
        r#"
filter_cases:
  - name: sc_origin
    filter_rules:
      - name: internal_hop
        condition:
          op_isinsubnet:
            arg:
              term_reqheader: x-forwarded-for
            network: "10.42.0.0/16"
        actions:
          - add_header:
              name: x-trusted-hop
              value:
                term_string: "true"
filter_phases:
  in_request_screening:
    external_default: [sc_origin]
"#,
    );
    let root = engine.root();

    // One of several hops inside the subnet is enough.
    let mut run = RunState::new(root, NetworkOrigin::External, Some("rp_A"));
    let mut msg = Message::get("/x");
    msg.req.set("x-forwarded-for", "203.0.113.7, 10.42.9.1");
    let mut exchange = msg.exchange();
    engine.process_request(&mut run, &mut exchange);
    drop(exchange);
    assert_eq!(msg.req.get("x-trusted-hop"), vec!["true"]);

    let mut run = RunState::new(root, NetworkOrigin::External, Some("rp_A"));
    let mut msg = Message::get("/x");
    msg.req.set("x-forwarded-for", "203.0.113.7, 198.51.100.4");
    let mut exchange = msg.exchange();
    engine.process_request(&mut run, &mut exchange);
    drop(exchange);
    assert!(msg.req.get("x-trusted-hop").is_empty());
}

#[test]
fn table_lookup_miss_redirects_to_fallback_case() {
    let engine = engine(
        r#"
kv_tables:
  fqdn_mapping:
    amf-internal.host: amf-external.example.org
filter_cases:
  - name: sc_map
    filter_rules:
      - name: map_target
        condition:
          op_exists:
            arg:
              term_reqheader: 3gpp-sbi-target-apiroot
        actions:
          - modify_header:
              name: 3gpp-sbi-target-apiroot
              modifiers:
                - table_lookup:
                    table: fqdn_mapping
                    fc_unsuccessful: fc_mapping_failed
  - name: fc_mapping_failed
    filter_rules:
      - name: reply
        condition:
          term_boolean: true
        actions:
          - reject_message:
              status: 500
              title: Mapping failure
filter_phases:
  in_request_screening:
    own_network: [sc_map]
"#,
    );
    let root = engine.root();

    let mut run = RunState::new(root, NetworkOrigin::Internal, None);
    let mut msg = Message::get("/x");
    msg.req.set("3gpp-sbi-target-apiroot", "amf-internal.host");
    let mut exchange = msg.exchange();
    assert!(matches!(
        engine.process_request(&mut run, &mut exchange),
        ExchangeOutcome::Continue
    ));
    drop(exchange);
    assert_eq!(msg.req.get("3gpp-sbi-target-apiroot"), vec!["amf-external.example.org"]);

    let mut run = RunState::new(root, NetworkOrigin::Internal, None);
    let mut msg = Message::get("/x");
    msg.req.set("3gpp-sbi-target-apiroot", "unknown.host");
    let mut exchange = msg.exchange();
    match engine.process_request(&mut run, &mut exchange) {
        ExchangeOutcome::LocalReply(Some(reply)) => {
            assert_eq!(reply.status, 500);
            assert_eq!(reply.title, "Mapping failure");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn scramble_on_egress_descramble_on_ingress() {
    const CONFIG: &str = r#"
scrambling_profiles:
  - roaming_partner: rp_A
    active_generation: "AA100"
    keys:
      - generation: "AA100"
        key: "9f3e1a0b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f7"
        iv: "0102030405060708090a0b0c"
filter_cases:
  - name: sc_hide
    filter_rules:
      - name: hide_target
        condition:
          op_exists:
            arg:
              term_reqheader: 3gpp-sbi-target-apiroot
        actions:
          - modify_header:
              name: 3gpp-sbi-target-apiroot
              modifiers:
                - scramble: {}
  - name: sc_unhide
    filter_rules:
      - name: unhide_target
        condition:
          op_exists:
            arg:
              term_reqheader: 3gpp-sbi-target-apiroot
        actions:
          - modify_header:
              name: 3gpp-sbi-target-apiroot
              modifiers:
                - descramble: {}
filter_phases:
  in_request_screening:
    per_roaming_partner:
      rp_A: [sc_unhide]
  routing:
    per_roaming_partner:
      rp_A: [sc_hide]
"#;
    let engine = engine(CONFIG);
    let root = engine.root();
    let fqdn = "amf1.region1.5gc.mnc012.mcc345.3gppnetwork.org";

    // Egress: phase 2 scrambles the first label for partner rp_A.
    let mut run = RunState::new(root, NetworkOrigin::External, Some("rp_A"));
    let mut msg = Message::get("/x");
    msg.req.set("3gpp-sbi-target-apiroot", fqdn);
    let mut exchange = msg.exchange();

    // Ingress screening descrambles; clear text stays clear only until
    // routing scrambles it again.
    engine.process_request(&mut run, &mut exchange);
    drop(exchange);
    let out = msg.req.get("3gpp-sbi-target-apiroot");
    assert_eq!(out.len(), 1);
    assert!(out[0].starts_with("AA100"));
    assert!(out[0].ends_with(".region1.5gc.mnc012.mcc345.3gppnetwork.org"));
    assert_ne!(out[0], fqdn);

    // Ingress alone restores the original.
    let engine2 = engine_without_routing(CONFIG);
    let root2 = engine2.root();
    let mut run = RunState::new(root2, NetworkOrigin::External, Some("rp_A"));
    let mut msg2 = Message::get("/x");
    msg2.req.set("3gpp-sbi-target-apiroot", &out[0]);
    let mut exchange = msg2.exchange();
    engine2.process_request(&mut run, &mut exchange);
    drop(exchange);
    assert_eq!(msg2.req.get("3gpp-sbi-target-apiroot"), vec![fqdn]);
}

fn engine_without_routing(yaml: &str) -> Engine {
    let mut config: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
    config["filter_phases"]
        .as_mapping_mut()
        .unwrap()
        .remove(&serde_yaml::Value::String("routing".into()));
    engine(&serde_yaml::to_string(&config).unwrap())
}

#[test]
fn case_insensitive_header_equality() {
    let engine = engine(
        r#"
filter_cases:
  - name: sc_ci
    filter_rules:
      - name: match_fqdn
        condition:
          op_equals_case_insensitive:
            left:
              term_reqheader: x-target
            right:
              term_string: "AMF1.Example.ORG"
        actions:
          - add_header:
              name: x-ci-match
              value:
                term_string: "1"
      - name: match_fqdn_exact
        condition:
          op_equals:
            left:
              term_reqheader: x-target
            right:
              term_string: "AMF1.Example.ORG"
        actions:
          - add_header:
              name: x-exact-match
              value:
                term_string: "1"
filter_phases:
  in_request_screening:
    own_network: [sc_ci]
"#,
    );
    let root = engine.root();
    let mut run = RunState::new(root, NetworkOrigin::Internal, None);
    let mut msg = Message::get("/x");
    msg.req.set("x-target", "amf1.example.org");
    let mut exchange = msg.exchange();
    engine.process_request(&mut run, &mut exchange);
    drop(exchange);
    assert_eq!(msg.req.get("x-ci-match"), vec!["1"]);
    // Exact equality is case-sensitive; differing only in case is a miss.
    assert!(msg.req.get("x-exact-match").is_empty());
}

#[test]
fn json_body_pointer_modification() {
    let engine = engine(
        r#"
kv_tables:
  fqdn_mapping:
    chf-internal.host: chf-external.example.org
filter_cases:
  - name: sc_body
    filter_rules:
      - name: map_callback
        condition:
          op_isvalidjson:
            body: request
        actions:
          - modify_json_body:
              pointer: /notificationUri/host
              modifiers:
                - table_lookup:
                    table: fqdn_mapping
                    do_nothing: true
filter_phases:
  in_request_screening:
    own_network: [sc_body]
"#,
    );
    let root = engine.root();
    let mut run = RunState::new(root, NetworkOrigin::Internal, None);
    let mut msg = Message::get("/x");
    msg.req_body = MemoryBody::from_json(&json!({
        "notificationUri": { "host": "chf-internal.host", "port": 8080 }
    }));
    let mut exchange = msg.exchange();
    assert!(matches!(
        engine.process_request(&mut run, &mut exchange),
        ExchangeOutcome::Continue
    ));
    drop(exchange);
    let body = msg.req_body.as_json().unwrap();
    assert_eq!(body["notificationUri"]["host"], json!("chf-external.example.org"));
    assert_eq!(body["notificationUri"]["port"], json!(8080));
}

#[tokio::test]
async fn pause_resume_with_slf_lookup() {
    let engine = engine(
        r#"
filter_cases:
  - name: sc_slf
    filter_data:
      - name: supi_from_path
        source: path
        extractor_regex: "/(?P<supi>imsi-\\d+)/"
    filter_rules:
      - name: resolve_region
        condition:
          op_exists:
            arg:
              term_var: supi
        actions:
          - lookup:
              service: slf
              source_var: supi
              destination_var: region
          - add_header:
              name: x-region
              value:
                term_var: region
filter_phases:
  in_request_screening:
    own_network: [sc_slf]
"#,
    );
    let root = engine.root();

    let mut slf = MemoryLookupService::new();
    slf.insert("imsi-262011234567890", json!("region-north"));

    let mut run = RunState::new(root, NetworkOrigin::Internal, None);
    let mut msg = Message::get("/nudm-sdm/v2/imsi-262011234567890/nssai");
    let mut exchange = msg.exchange();

    let (continuation, request) = match engine.process_request(&mut run, &mut exchange) {
        ExchangeOutcome::Paused { continuation, request } => (continuation, request),
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(request.query, "imsi-262011234567890");

    let result = slf.issue(&request).await.map(|r| r.value);
    let outcome = engine.resume(continuation, result, &mut run, &mut exchange);
    assert!(matches!(outcome, ExchangeOutcome::Continue));
    drop(exchange);
    assert_eq!(msg.req.get("x-region"), vec!["region-north"]);
}
