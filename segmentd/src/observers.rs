use std::fmt;

/// Registered callbacks of one kind, invoked in registration order.
pub struct Observers<F: ?Sized> {
    entries: Vec<Box<F>>,
}

impl<F: ?Sized> Default for Observers<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<F: ?Sized> Observers<F> {
    pub fn push(&mut self, observer: Box<F>) {
        self.entries.push(observer);
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<F>> {
        self.entries.iter_mut()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<F: ?Sized> fmt::Debug for Observers<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observers_run_in_registration_order_and_clear() {
        let mut seen = Vec::new();
        {
            let mut observers: Observers<dyn FnMut(&mut Vec<u8>)> = Observers::default();
            observers.clear();
            observers.push(Box::new(|out: &mut Vec<u8>| out.push(1)));
            observers.push(Box::new(|out: &mut Vec<u8>| out.push(2)));
            for observer in observers.iter_mut() {
                observer(&mut seen);
            }
            assert_eq!(observers.len(), 2);
            observers.clear();
            assert!(observers.is_empty());
        }
        assert_eq!(seen, vec![1, 2]);
    }
}
