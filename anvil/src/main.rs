// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

/// Entry point (spec §4.11, §6.4): translates the core's `Result<_, Error>`
/// into a process exit code. 0 on success, 1 when the failure is a reported
/// `BuildFailure` (or a subcommand error wrapping one), 2 otherwise.
#[tokio::main]
async fn main() {
    env_logger::init();

    match anvil::cli::process().await {
        Ok(()) => {}
        Err(err) => {
            let is_build_failure = is_build_failure(&err);

            eprintln!("anvil: {err}");

            std::process::exit(if is_build_failure { 1 } else { 2 });
        }
    }
}

/// Walks an error's `source()` chain looking for the reported
/// `anvil_diag::BuildFailure` sentinel, since `thiserror`'s `Display` only
/// ever prints its own variant's message and never a wrapped source's.
fn is_build_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if e.downcast_ref::<anvil_diag::BuildFailure>().is_some() {
            return true;
        }
        cur = e.source();
    }
    false
}
