//! Command lines run on the rigs.

use crate::config::RemoteLayout;

/// Flash `image` (already uploaded to the build_out folder).
pub fn flash(layout: &RemoteLayout, image: &str, attack_board: bool) -> String {
    let board = if attack_board { " --attack-board" } else { "" };
    format!(
        "{} || exit 1; {} {}/{}{}",
        layout.activate, layout.update_script, layout.build_out, image, board
    )
}

pub fn run_tests(layout: &RemoteLayout, scenario: &str) -> String {
    format!(
        "{} || exit 1; cd {} && {} {}",
        layout.activate, layout.design_dir, layout.test_runner, scenario
    )
}

pub fn run_attack(layout: &RemoteLayout, scenario: &str) -> String {
    format!(
        "{} || exit 1; cd {} && {} {}",
        layout.activate, layout.attack_dir, layout.attack_runner, scenario
    )
}

/// Run an uploaded attack script: `.py` through the interpreter, anything
/// else as an executable.
pub fn run_script(layout: &RemoteLayout, script_name: &str) -> String {
    let invoke = if script_name.ends_with(".py") {
        format!("python3 ./{script_name}")
    } else {
        format!("chmod +x ./{script_name} && ./{script_name}")
    };
    format!("{} || exit 1; cd {} && {}", layout.activate, layout.attack_dir, invoke)
}

pub fn pull_latest(layout: &RemoteLayout) -> String {
    layout.pull_command.clone()
}
