//! Double-buffered storage with an explicit current side

/// Two same-sized buffers, exactly one of which is current.
///
/// Passes read the current side and write the other, then [`flip`](Self::flip).
#[derive(Debug, Clone)]
pub struct PingPong<T> {
    a: T,
    b: T,
    current_is_a: bool,
}

impl<T> PingPong<T> {
    pub fn new(a: T, b: T) -> Self {
        Self {
            a,
            b,
            current_is_a: true,
        }
    }

    pub fn current_is_a(&self) -> bool {
        self.current_is_a
    }

    pub fn current(&self) -> &T {
        if self.current_is_a {
            &self.a
        } else {
            &self.b
        }
    }

    pub fn current_mut(&mut self) -> &mut T {
        if self.current_is_a {
            &mut self.a
        } else {
            &mut self.b
        }
    }

    pub fn other(&self) -> &T {
        if self.current_is_a {
            &self.b
        } else {
            &self.a
        }
    }

    pub fn other_mut(&mut self) -> &mut T {
        if self.current_is_a {
            &mut self.b
        } else {
            &mut self.a
        }
    }

    /// Both sides at once: `(current, other)`
    pub fn split_mut(&mut self) -> (&mut T, &mut T) {
        if self.current_is_a {
            (&mut self.a, &mut self.b)
        } else {
            (&mut self.b, &mut self.a)
        }
    }

    /// Make the other side current
    pub fn flip(&mut self) {
        self.current_is_a = !self.current_is_a;
    }

    /// Make side A current again
    pub fn reset(&mut self) {
        self.current_is_a = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_flips_leave_other_side_current() {
        let mut field = PingPong::new(vec![0.0f32], vec![0.0f32]);
        for pass in 0..3 {
            let (src, dst) = field.split_mut();
            dst[0] = src[0] + 1.0;
            field.flip();
            assert_eq!(field.current()[0], pass as f32 + 1.0);
        }
        assert!(!field.current_is_a());
        field.reset();
        assert!(field.current_is_a());
    }
}
