use crate::session::SessionCommand;
use runwatch_core::Command;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

pub const USAGE: &str = "commands: run all | run <assembly> <test>... | discover | status | quit";

pub fn parse_command(line: &str) -> Result<Option<SessionCommand>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let command = match words.as_slice() {
        [] => return Ok(None),
        ["run", "all"] | ["runall"] => SessionCommand::Issue(Command::RunAll),
        ["run", assembly_name, test_codes @ ..] if !test_codes.is_empty() => {
            SessionCommand::Issue(Command::RunTests {
                test_codes: test_codes.iter().map(|code| code.to_string()).collect(),
                assembly_name: assembly_name.to_string(),
            })
        }
        ["discover"] | ["discover", "all"] => SessionCommand::Issue(Command::DiscoverAll),
        ["status"] | ["summary"] => SessionCommand::Summary,
        ["quit"] | ["exit"] | ["q"] => SessionCommand::Quit,
        _ => return Err(format!("unrecognized command `{}`; {USAGE}", line.trim())),
    };
    Ok(Some(command))
}

/// Feeds parsed lines from `reader` into the session queue until EOF, `quit`, or
/// the session side hangs up.
pub async fn read_commands<R>(reader: R, tx: mpsc::Sender<SessionCommand>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_command(&line) {
                Ok(Some(command)) => {
                    let quit = command == SessionCommand::Quit;
                    if tx.send(command).await.is_err() || quit {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => eprintln!("{err}"),
            },
            Ok(None) => break,
            Err(err) => {
                warn!(event = "stdin_read_error", error = %err);
                break;
            }
        }
    }
}
