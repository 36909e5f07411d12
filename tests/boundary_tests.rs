use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn test_boundary_balance_near_u64_max() {
    let output_path = std::path::PathBuf::from("boundary_test.csv");
    let mut wtr = csv::Writer::from_path(&output_path).unwrap();
    wtr.write_record(["op", "user", "target", "amount"]).unwrap();

    // i64::MAX twice still fits a u64 balance; a third time overflows
    wtr.write_record(["deposit", "whale", "", "9223372036854775807"])
        .unwrap();
    wtr.write_record(["deposit", "whale", "", "9223372036854775807"])
        .unwrap();
    wtr.write_record(["deposit", "whale", "", "9223372036854775807"])
        .unwrap();
    wtr.flush().unwrap();
    drop(wtr);

    let mut cmd = Command::new(cargo_bin!("coin-settlement"));
    cmd.arg("replay").arg(&output_path);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("user_id,balance"))
        .stdout(predicate::str::contains("whale,18446744073709551614"))
        .stderr(predicate::str::contains("would overflow"));

    std::fs::remove_file(output_path).ok();
}

#[test]
fn test_zero_and_negative_amounts_are_rejected() {
    for amount in ["0", "-5"] {
        let mut cmd = Command::new(cargo_bin!("coin-settlement"));
        cmd.args(["deposit", "alice", amount]);

        cmd.assert()
            .failure()
            .stderr(predicate::str::contains("Invalid amount"));
    }
}

#[test]
fn test_self_transfer_is_rejected() {
    let mut cmd = Command::new(cargo_bin!("coin-settlement"));
    cmd.args(["transfer", "alice", "alice", "1"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Cannot transfer to self"));
}

#[test]
fn test_commission_percent_out_of_range() {
    let mut cmd = Command::new(cargo_bin!("coin-settlement"));
    cmd.args(["settle", "commission", "--month", "2025-06", "--percent", "150"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid commission percent"));
}

#[test]
fn test_malformed_month_key() {
    let mut cmd = Command::new(cargo_bin!("coin-settlement"));
    cmd.args(["show", "commissions", "--month", "2025-6"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid month key"));
}
