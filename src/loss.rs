//! Loss function(s)
//!
//! All losses take predictions and targets of equal length and reduce by the mean.

use crate::{config::LossKind, values::Value};

/// Mean Squared Error Loss between two vectors of values
pub struct MSELoss;

impl MSELoss {
    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        mean(
            y_pred
                .iter()
                .zip(y_true.iter())
                .map(|(a, b)| {
                    let diff = a.as_ref() - b.as_ref();
                    &diff * &diff
                }),
            y_pred.len(),
        )
    }
}

/// Huber loss, quadratic within `delta` of the target and linear outside
pub struct HuberLoss;

impl HuberLoss {
    pub const DELTA: f32 = 1.0;

    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        let delta = Value::new(Self::DELTA);
        let half = Value::new(0.5);
        mean(
            y_pred.iter().zip(y_true.iter()).map(|(a, b)| {
                let diff = a.as_ref() - b.as_ref();
                let abs = diff.abs();
                if abs.data() <= Self::DELTA {
                    &(&diff * &diff) * &half
                } else {
                    &delta * &(&abs - &(&half * &delta))
                }
            }),
            y_pred.len(),
        )
    }
}

/// Binary cross entropy on probabilities, log terms are clamped at -100 like PyTorch does
pub struct BCELoss;

impl BCELoss {
    const LOG_CLAMP: f32 = -100.0;

    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        let one = Value::new(1.0);
        mean(
            y_pred.iter().zip(y_true.iter()).map(|(p, y)| {
                let (p, y) = (p.as_ref(), y.as_ref());
                let log_p = clamped_ln(p);
                let log_not_p = clamped_ln(&(&one - p));
                -&(&(y * &log_p) + &(&(&one - y) * &log_not_p))
            }),
            y_pred.len(),
        )
    }
}

fn clamped_ln(x: &Value) -> Value {
    if x.data() > BCELoss::LOG_CLAMP.exp() {
        x.ln()
    } else {
        // gradient is cut where the log is clamped
        Value::new(BCELoss::LOG_CLAMP)
    }
}

/// Binary cross entropy on logits, `max(x, 0) - x * y + ln(1 + exp(-|x|))`
pub struct BCEWithLogitsLoss;

impl BCEWithLogitsLoss {
    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        let one = Value::new(1.0);
        mean(
            y_pred.iter().zip(y_true.iter()).map(|(x, y)| {
                let (x, y) = (x.as_ref(), y.as_ref());
                let log_term = (&one + &(-&x.abs()).exp()).ln();
                &(&x.relu() - &(x * y)) + &log_term
            }),
            y_pred.len(),
        )
    }
}

fn mean(terms: impl Iterator<Item = Value>, n: usize) -> Value {
    terms.sum::<Value>() / Value::new(n.max(1) as f32)
}

/// Dispatches to the loss selected in the training config
pub fn compute_loss<T, U>(kind: LossKind, y_pred: &[T], y_true: &[U]) -> Value
where
    T: AsRef<Value>,
    U: AsRef<Value>,
{
    match kind {
        LossKind::Huber => HuberLoss::call(y_pred, y_true),
        LossKind::Mse => MSELoss::call(y_pred, y_true),
        LossKind::Bce => BCELoss::call(y_pred, y_true),
        LossKind::Bcelogit => BCEWithLogitsLoss::call(y_pred, y_true),
    }
}

/// Same as [`compute_loss`] on plain floats, used where no gradient is needed
pub fn compute_loss_f32(kind: LossKind, y_pred: &[f32], y_true: &[f32]) -> f32 {
    let n = y_pred.len().max(1) as f32;
    let total: f32 = y_pred
        .iter()
        .zip(y_true.iter())
        .map(|(p, y)| match kind {
            LossKind::Mse => (p - y).powi(2),
            LossKind::Huber => {
                let abs = (p - y).abs();
                if abs <= HuberLoss::DELTA {
                    0.5 * abs * abs
                } else {
                    HuberLoss::DELTA * (abs - 0.5 * HuberLoss::DELTA)
                }
            }
            LossKind::Bce => {
                let log_p = p.ln().max(BCELoss::LOG_CLAMP);
                let log_not_p = (1.0 - p).ln().max(BCELoss::LOG_CLAMP);
                -(y * log_p + (1.0 - y) * log_not_p)
            }
            LossKind::Bcelogit => p.max(0.0) - p * y + (-p.abs()).exp().ln_1p(),
        })
        .sum();
    total / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;
    use proptest::prelude::*;

    fn values(xs: &[f32]) -> Vec<Value> {
        xs.iter().map(|x| Value::new(*x)).collect()
    }

    #[test]
    fn test_mse_loss() {
        let y_pred = vec![Value::new(2.0), Value::new(3.0)];
        let y_true = vec![Value::new(1.0), Value::new(5.0)];
        let loss = MSELoss::call(&y_pred, &y_true);
        assert_eq!(loss.data(), 2.5);

        loss.backward();
        // dloss / dy_pred = 1/N * 2 * (y_pred - y_true)
        // dloss / dy_true = -1/N * 2 * (y_pred - y_true)
        assert_eq!(y_pred[0].grad(), 1.0);
        assert_eq!(y_pred[1].grad(), -2.0);
        assert_eq!(y_true[0].grad(), -1.0);
        assert_eq!(y_true[1].grad(), 2.0);
    }

    #[test]
    fn test_huber_loss() {
        // one residual inside delta, one outside
        let y_pred = values(&[0.5, 4.0]);
        let y_true = values(&[0.0, 1.0]);
        let loss = HuberLoss::call(&y_pred, &y_true);
        // (0.5 * 0.25 + (3 - 0.5)) / 2
        assert_eq_float!(loss.data(), (0.125 + 2.5) / 2.0);

        loss.backward();
        // quadratic region: d/dp = (p - y) / N, linear region: delta * sign / N
        assert_eq_float!(y_pred[0].grad(), 0.25);
        assert_eq_float!(y_pred[1].grad(), 0.5);
    }

    #[test]
    fn test_bce_loss() {
        let y_pred = values(&[0.8, 0.3]);
        let y_true = values(&[1.0, 0.0]);
        let loss = BCELoss::call(&y_pred, &y_true);
        let expected = -(0.8f32.ln() + 0.7f32.ln()) / 2.0;
        assert_eq_float!(loss.data(), expected);

        loss.backward();
        // d/dp = (p - y) / (p (1 - p)) / N
        assert_eq_float!(y_pred[0].grad(), (0.8 - 1.0) / (0.8 * 0.2) / 2.0);
    }

    #[test]
    fn test_bce_clamps_log() {
        let loss = BCELoss::call(&values(&[0.0]), &values(&[1.0]));
        assert_eq_float!(loss.data(), 100.0);
    }

    #[test]
    fn test_bce_with_logits_matches_bce() {
        let logits = values(&[1.5, -0.7]);
        let y_true = values(&[1.0, 0.0]);
        let probs: Vec<Value> = logits.iter().map(|x| Value::new(x.data()).sigmoid()).collect();
        let with_logits = BCEWithLogitsLoss::call(&logits, &y_true);
        let plain = BCELoss::call(&probs, &y_true);
        assert!((with_logits.data() - plain.data()).abs() < 1e-5);

        with_logits.backward();
        // d/dx = (sigmoid(x) - y) / N
        assert!((logits[0].grad() - (probs[0].data() - 1.0) / 2.0).abs() < 1e-5);
    }

    proptest! {
        #[test]
        fn prop_f32_loss_matches_graph_loss(
            pairs in proptest::collection::vec((-5.0f32..5.0, -5.0f32..5.0), 1..16)
        ) {
            let (pred, target): (Vec<f32>, Vec<f32>) = pairs.into_iter().unzip();
            for kind in [LossKind::Mse, LossKind::Huber, LossKind::Bcelogit] {
                let graph = compute_loss(kind, &values(&pred), &values(&target)).data();
                let plain = compute_loss_f32(kind, &pred, &target);
                prop_assert!((graph - plain).abs() <= 1e-3 * (1.0 + plain.abs()));
            }
        }
    }
}
