//! `go2jail test-mail` — SMTP connectivity probe.
//!
//! Sends a short test message through each named mail jail using the
//! jail's `send_mail` capability, without going through `arrest`.

use anyhow::Result;

use crate::cli::TestMailArgs;
use crate::commands::load_config;

const PROBE_SUBJECT: &str = "go2jail connection test";
const PROBE_BODY: &str =
    r#"<div id="root"><p>This email is just a test of the SMTP connection.</p><p>You may ignore it.</p></div>"#;

pub async fn run(args: TestMailArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    for id in &args.jail_ids {
        let Some(entry) = config.jail(id) else {
            anyhow::bail!("jail not found: {id}");
        };
        let Some(mailer) = entry.jail.as_mailer() else {
            anyhow::bail!("jail is not a mail jail: {id}");
        };
        match mailer.send_mail(PROBE_SUBJECT, PROBE_BODY).await {
            Ok(()) => println!("MAIL TESTING OK: {id}"),
            Err(e) => {
                println!("MAIL TESTING FAIL: {id}");
                return Err(e.into());
            }
        }
    }
    Ok(())
}
