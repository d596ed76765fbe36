//! Derive functions: event page -> new `(xs, ys)` points

use std::collections::VecDeque;

use crate::document::EventPage;
use crate::expr::{Expr, ExpressionError, PageNamespace};

use super::ArtistError;

/// Turns one event page into the points it contributes
///
/// Returning two empty vectors means "nothing to add".
pub trait Derive: Send {
    /// Points contributed by `page`
    fn derive(&mut self, page: &EventPage) -> Result<(Vec<f64>, Vec<f64>), ArtistError>;
}

impl<F> Derive for F
where
    F: FnMut(&EventPage) -> Result<(Vec<f64>, Vec<f64>), ArtistError> + Send,
{
    fn derive(&mut self, page: &EventPage) -> Result<(Vec<f64>, Vec<f64>), ArtistError> {
        self(page)
    }
}

/// x and y expressions evaluated against each page
#[derive(Clone, Debug)]
pub struct ExprDerive {
    x: Expr,
    y: Expr,
}

impl ExprDerive {
    /// Compile both expressions
    pub fn new(x: &str, y: &str) -> Result<Self, ExpressionError> {
        Ok(Self {
            x: Expr::parse(x)?,
            y: Expr::parse(y)?,
        })
    }
}

impl Derive for ExprDerive {
    fn derive(&mut self, page: &EventPage) -> Result<(Vec<f64>, Vec<f64>), ArtistError> {
        let ns = PageNamespace::new(page);
        let height = page.height();
        let xs = self.x.eval(&ns)?.into_column(height);
        let ys = self.y.eval(&ns)?.into_column(height);
        Ok((xs, ys))
    }
}

/// Trailing mean of `y` over `window` rows, plotted against `x`
///
/// Rows before the window has filled contribute nothing, so early pages
/// derive to empty output.
#[derive(Clone, Debug)]
pub struct MovingAverage {
    exprs: ExprDerive,
    window: usize,
    recent: VecDeque<f64>,
}

impl Derive for MovingAverage {
    #[allow(clippy::cast_precision_loss)]
    fn derive(&mut self, page: &EventPage) -> Result<(Vec<f64>, Vec<f64>), ArtistError> {
        let (xs, ys) = self.exprs.derive(page)?;
        if xs.len() != ys.len() {
            return Err(ArtistError::ShapeMismatch {
                xs: xs.len(),
                ys: ys.len(),
            });
        }

        let mut out_x = Vec::new();
        let mut out_y = Vec::new();
        for (x, y) in xs.into_iter().zip(ys) {
            self.recent.push_back(y);
            if self.recent.len() > self.window {
                self.recent.pop_front();
            }
            if self.recent.len() == self.window {
                out_x.push(x);
                out_y.push(self.recent.iter().sum::<f64>() / self.window as f64);
            }
        }
        Ok((out_x, out_y))
    }
}

/// Build a [`MovingAverage`]; a window of 0 is treated as 1
pub fn moving_average(x: &str, y: &str, window: usize) -> Result<MovingAverage, ExpressionError> {
    Ok(MovingAverage {
        exprs: ExprDerive::new(x, y)?,
        window: window.max(1),
        recent: VecDeque::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(first_seq: u64, ys: &[f64]) -> EventPage {
        EventPage::from_columns(
            "d",
            first_seq,
            [("I", ys.iter().map(|y| json!(y)).collect())],
        )
    }

    #[test]
    fn test_expr_derive_broadcasts_scalars() {
        let mut derive = ExprDerive::new("seq_num", "2").unwrap();
        let (xs, ys) = derive.derive(&page(1, &[5.0, 6.0])).unwrap();
        assert_eq!(xs, vec![1.0, 2.0]);
        assert_eq!(ys, vec![2.0, 2.0]);
    }

    #[test]
    fn test_moving_average_waits_for_window() {
        let mut avg = moving_average("seq_num", "I", 3).unwrap();

        let (xs, ys) = avg.derive(&page(1, &[1.0, 2.0])).unwrap();
        assert!(xs.is_empty() && ys.is_empty());

        let (xs, ys) = avg.derive(&page(3, &[3.0, 7.0])).unwrap();
        assert_eq!(xs, vec![3.0, 4.0]);
        assert_eq!(ys, vec![2.0, 4.0]);
    }

    #[test]
    fn test_closure_derive() {
        let mut derive = |p: &EventPage| -> Result<(Vec<f64>, Vec<f64>), ArtistError> {
            Ok((vec![0.0; p.height()], vec![1.0; p.height()]))
        };
        let (xs, _) = Derive::derive(&mut derive, &page(1, &[1.0, 2.0, 3.0])).unwrap();
        assert_eq!(xs.len(), 3);
    }
}
