//! Operator interaction
//!
//! Confirmation prompts and the Ctrl+C flag that cuts task waits short.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Asks the operator a yes/no question
pub trait Confirm: Send + Sync {
    /// Returns the answer; `default` is used for an empty reply
    fn ask(&self, question: &str, default: bool) -> Result<bool>;

    /// Print a notice the operator should read before answering
    fn notice(&self, text: &str);

    /// `Err(Aborted)` unless the operator says yes
    fn require(&self, question: &str) -> Result<()> {
        if self.ask(question, false)? {
            Ok(())
        } else {
            Err(Error::Aborted)
        }
    }
}

/// Prompts on stdout and reads the reply from stdin
#[derive(Debug, Default)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn ask(&self, question: &str, default: bool) -> Result<bool> {
        let hint = if default { "yes" } else { "no" };
        let stdin = std::io::stdin();
        loop {
            print!("{} [{}]: ", question, hint);
            std::io::stdout().flush()?;

            let mut input = String::new();
            if stdin.lock().read_line(&mut input)? == 0 {
                // EOF
                return Ok(default);
            }
            match input.trim().to_lowercase().as_str() {
                "" => return Ok(default),
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => continue,
            }
        }
    }

    fn notice(&self, text: &str) {
        println!("{}", text);
    }
}

/// Answers every question the same way and records what was asked
#[derive(Debug, Default)]
pub struct AutoConfirm {
    answer: bool,
    asked: Mutex<Vec<String>>,
}

impl AutoConfirm {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Questions asked and notices shown so far
    pub fn transcript(&self) -> Vec<String> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }

    fn push(&self, line: &str) {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(line.to_string());
        }
    }
}

impl Confirm for AutoConfirm {
    fn ask(&self, question: &str, _default: bool) -> Result<bool> {
        self.push(question);
        Ok(self.answer)
    }

    fn notice(&self, text: &str) {
        self.push(text);
    }
}

/// Read a password from stdin without a confirmation round
pub fn read_password(label: &str) -> Result<String> {
    print!("{} password: ", label);
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}

/// Set once the operator presses Ctrl+C
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route Ctrl+C to this flag. Call once per process.
    pub fn install(&self) -> Result<()> {
        let flag = self.0.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|e| Error::Internal(format!("Failed to install Ctrl+C handler: {}", e)))
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_confirm() {
        let yes = AutoConfirm::new(true);
        assert!(yes.require("Continue to delete?").is_ok());
        yes.notice("Deleting a master is irreversible.");
        assert_eq!(yes.transcript().len(), 2);

        let no = AutoConfirm::new(false);
        assert!(matches!(no.require("Proceed with cleaning?"), Err(Error::Aborted)));
    }

    #[test]
    fn test_interrupt_flag_is_shared() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        assert!(!clone.is_set());
        interrupt.trigger();
        assert!(clone.is_set());
    }
}
