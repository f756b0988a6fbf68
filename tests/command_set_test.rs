//! Integration tests for command sets loaded from YAML.

use automat::command::{CommandSet, CommandValue, MatchKind};
use automat::error::CommandError;
use std::path::PathBuf;

fn syringe_pump() -> CommandSet {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/commands/syringe_pump.yaml");
    CommandSet::from_yaml_file(&path).unwrap()
}

#[test]
fn test_sample_file_loads_in_order() {
    let set = syringe_pump();
    assert_eq!(set.device().name, "Syringe pump");
    assert_eq!(set.cmds(), vec!["SP", "VL", "MV", "TP", "ZR"]);
    assert_eq!(set.get("speed").unwrap().reference(), "manual p. 12");
}

#[test]
fn test_set_range_is_enforced_before_building() {
    let set = syringe_pump();
    let speed = set.get("SP").unwrap();

    let built = speed.cmd_set(15).unwrap();
    assert_eq!(built, "SP15");
    assert_eq!(speed.match_str(&built).kind(), MatchKind::Set);

    for outside in [9, 21, -1] {
        match speed.cmd_set(outside) {
            Err(CommandError::OutOfRange { value, min, max, .. }) => {
                assert_eq!(value, f64::from(outside));
                assert_eq!((min, max), (10.0, 20.0));
            }
            other => panic!("expected out of range for {outside}, got {other:?}"),
        }
    }
    assert!(matches!(speed.cmd_set("fast"), Err(CommandError::NotNumeric { .. })));
}

#[test]
fn test_set_names_resolve_to_wire_values() {
    let set = syringe_pump();
    let valve = set.get("valve").unwrap();
    assert_eq!(valve.cmd_set("bypass").unwrap(), "VLB");
    assert!(matches!(valve.cmd_set("sideways"), Err(CommandError::RegexMismatch { .. })));
}

#[test]
fn test_int_response_decodes_and_mismatch_yields_none() {
    let set = syringe_pump();
    let matched = set.match_str("SP?").unwrap();
    assert!(matched.is_query());
    assert_eq!(matched.parse(Some("SP=17")).unwrap(), Some(CommandValue::Int(17)));
    assert_eq!(matched.parse(Some("ERR 4")).unwrap(), None);
}

#[test]
fn test_set_strings_decode_embedded_values() {
    let set = syringe_pump();
    let matched = set.match_str("MV1500").unwrap();
    assert_eq!(matched.command().name(), "move");
    assert_eq!(matched.parse(None).unwrap(), Some(CommandValue::Int(1500)));

    let home = set.match_str("ZR").unwrap();
    assert_eq!(home.kind(), MatchKind::Set);
    assert_eq!(home.parse(None).unwrap(), None);

    let temperature = set.match_str("TP?").unwrap();
    assert_eq!(
        temperature.parse(Some("T=-3.25")).unwrap(),
        Some(CommandValue::Float(-3.25))
    );
}

#[test]
fn test_unmatched_string_is_not_an_error() {
    let set = syringe_pump();
    assert!(set.match_str("XX42").is_none());
    assert!(set.match_str("SP?X").is_none());
}

#[test]
fn test_reset_and_missing_query() {
    let set = syringe_pump();
    assert_eq!(set.get("speed").unwrap().cmd_reset().unwrap(), "SP12");
    assert!(matches!(set.get("move").unwrap().cmd_query(), Err(CommandError::NoQuery(_))));
    assert!(matches!(set.get("valve").unwrap().cmd_reset(), Err(CommandError::NoReset(_))));
}
