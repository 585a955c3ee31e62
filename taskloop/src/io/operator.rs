//! Operator answers read from one shared line source.
//!
//! The manual agent and the failure prompt both read from the terminal.
//! Handing them clones of one [`OperatorInput`] keeps a single buffer, so
//! neither can swallow lines typed for the other.

use std::cell::RefCell;
use std::io::{self, BufRead};
use std::rc::Rc;

#[derive(Clone)]
pub struct OperatorInput {
    reader: Rc<RefCell<Box<dyn BufRead>>>,
}

impl OperatorInput {
    pub fn new(reader: impl BufRead + 'static) -> Self {
        Self {
            reader: Rc::new(RefCell::new(Box::new(reader))),
        }
    }

    /// Locks stdin for the life of the process.
    pub fn stdin() -> Self {
        Self::new(io::stdin().lock())
    }

    /// Next line without its terminator, or `None` at end of input.
    pub fn read_line(&self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.borrow_mut().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn clones_consume_lines_in_order() {
        let first = OperatorInput::new(Cursor::new("one\r\ntwo\nthree"));
        let second = first.clone();
        assert_eq!(first.read_line().expect("read").as_deref(), Some("one"));
        assert_eq!(second.read_line().expect("read").as_deref(), Some("two"));
        assert_eq!(first.read_line().expect("read").as_deref(), Some("three"));
        assert_eq!(second.read_line().expect("read"), None);
    }
}
