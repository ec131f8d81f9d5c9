/// Два независимых сигнала готовности. Завершение сообщается ровно один раз:
/// тем вызовом `set_*`, после которого заданы оба значения.
/// Повторная установка стороны заменяет значение (last-write-wins).
#[derive(Debug, Clone)]
pub struct Join<L, R> {
    left: Option<L>,
    right: Option<R>,
}

impl<L, R> Default for Join<L, R> {
    fn default() -> Self {
        Self {
            left: None,
            right: None,
        }
    }
}

impl<L, R> Join<L, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_left(&mut self, value: L) -> bool {
        let was_complete = self.is_complete();
        self.left = Some(value);
        !was_complete && self.is_complete()
    }

    pub fn set_right(&mut self, value: R) -> bool {
        let was_complete = self.is_complete();
        self.right = Some(value);
        !was_complete && self.is_complete()
    }

    pub fn left(&self) -> Option<&L> {
        self.left.as_ref()
    }

    pub fn right(&self) -> Option<&R> {
        self.right.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_once_in_either_order() {
        let mut a: Join<u8, &str> = Join::new();
        assert!(!a.set_left(1));
        assert!(a.set_right("x"));
        assert!(!a.set_right("y"));
        assert_eq!(a.left(), Some(&1));
        assert_eq!(a.right(), Some(&"y"));

        let mut b: Join<u8, &str> = Join::new();
        assert!(!b.set_right("x"));
        assert!(b.set_left(1));
        assert!(!b.set_left(2));
        assert!(b.is_complete());
        assert_eq!(b.left(), Some(&2));
    }

    #[test]
    fn one_side_is_not_complete() {
        let mut j: Join<u8, u8> = Join::new();
        assert!(!j.set_left(1));
        assert!(!j.set_left(2));
        assert!(!j.is_complete());
        assert_eq!(j.right(), None);
    }
}
