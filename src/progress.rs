/// Receives progress from long running operations like verification and extraction
pub trait Progress {
    fn set_total(&mut self, total: u64) {
        let _ = total;
    }

    fn report_add(&mut self, amount: u64) {
        let _ = amount;
    }

    fn log_message(&mut self, message: &str) {
        let _ = message;
    }
}

/// Discards everything
impl Progress for () {}

impl<P: ?Sized + Progress> Progress for &mut P {
    fn set_total(&mut self, total: u64) {
        (**self).set_total(total)
    }

    fn report_add(&mut self, amount: u64) {
        (**self).report_add(amount)
    }

    fn log_message(&mut self, message: &str) {
        (**self).log_message(message)
    }
}
