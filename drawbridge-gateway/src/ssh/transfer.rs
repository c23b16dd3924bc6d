//! Classification of session channels into observed transfers.
//!
//! SCP rides on `exec` with a `-t` (upload) or `-f` (download) flag; SFTP is
//! a subsystem. Both suppress the byte-level transcript and are tracked as
//! `SessionTransfer` rows instead.

use grant_store::TransferKind;

/// Classifies an `exec` command line; returns the transfer kind and the
/// remote path when the command is an SCP sink or source.
pub fn classify_exec(command: &str) -> Option<(TransferKind, Option<String>)> {
    let mut tokens = command.split_whitespace();
    if tokens.next() != Some("scp") {
        return None;
    }

    let mut kind = None;
    let mut path = None;

    for token in tokens {
        if let Some(flags) = token.strip_prefix('-') {
            if flags.contains('t') {
                kind = Some(TransferKind::ScpUpload);
            } else if flags.contains('f') {
                kind = Some(TransferKind::ScpDownload);
            }
        } else if path.is_none() {
            path = Some(token.to_owned());
        }
    }

    kind.map(|kind| (kind, path))
}

/// True when the subsystem suppresses the transcript and is tracked as an
/// `sftp_session` transfer.
pub fn is_sftp_subsystem(name: &str) -> bool {
    name == "sftp"
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("scp -t /tmp/upload.bin", TransferKind::ScpUpload, Some("/tmp/upload.bin"))]
    #[case("scp -f /etc/passwd", TransferKind::ScpDownload, Some("/etc/passwd"))]
    #[case("scp -r -t /var/data", TransferKind::ScpUpload, Some("/var/data"))]
    #[case("scp -prt .", TransferKind::ScpUpload, Some("."))]
    fn classifies_scp_commands(
        #[case] command: &str,
        #[case] kind: TransferKind,
        #[case] path: Option<&str>,
    ) {
        let (got_kind, got_path) = classify_exec(command).expect("scp command");
        assert_eq!(got_kind, kind);
        assert_eq!(got_path.as_deref(), path);
    }

    #[rstest]
    #[case("ls -la")]
    #[case("scpx -t /tmp")]
    #[case("scp /local/file")] // neither sink nor source mode
    #[case("")]
    fn other_commands_are_not_transfers(#[case] command: &str) {
        assert!(classify_exec(command).is_none());
    }

    #[test]
    fn sftp_subsystem_is_recognized() {
        assert!(is_sftp_subsystem("sftp"));
        assert!(!is_sftp_subsystem("netconf"));
    }
}
