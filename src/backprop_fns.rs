//! Local derivatives of the graph operations
//!
//! Every derived [`Value`] remembers the [`BackpropFunc`] which produced it. During the
//! backward pass the gradient of a node is pushed to its operands scaled by the partial
//! derivative of the operation with respect to each operand.

use crate::values::Value;

/// Operation which created a node in the computation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    ReLU,
    Exp,
    Ln,
    Tanh,
    Sigmoid,
    Abs,
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        use BackpropFunc::*;
        match self {
            Add | Sub | Mul | Div => 2,
            Neg | ReLU | Exp | Ln | Tanh | Sigmoid | Abs => 1,
        }
    }

    /// `d out / d operand` for each operand, `out` is the forward result.
    ///
    /// `Abs` uses the subgradient 0 at 0.
    pub fn local_grads(&self, operands: &[f32], out: f32) -> [f32; 2] {
        let a = operands.first().copied().unwrap_or(0.0);
        let b = operands.get(1).copied().unwrap_or(0.0);
        match self {
            BackpropFunc::Add => [1.0, 1.0],
            BackpropFunc::Sub => [1.0, -1.0],
            BackpropFunc::Mul => [b, a],
            BackpropFunc::Div => [1.0 / b, -a / (b * b)],
            BackpropFunc::Neg => [-1.0, 0.0],
            BackpropFunc::ReLU => [if a > 0.0 { 1.0 } else { 0.0 }, 0.0],
            BackpropFunc::Exp => [out, 0.0],
            BackpropFunc::Ln => [1.0 / a, 0.0],
            BackpropFunc::Tanh => [1.0 - out * out, 0.0],
            BackpropFunc::Sigmoid => [out * (1.0 - out), 0.0],
            BackpropFunc::Abs => [sign(a), 0.0],
        }
    }
}

fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Accumulates the gradient of `node` into its operands. Leaves are left untouched.
pub(crate) fn propagate(node: &Value) {
    let inner = node.0.borrow();
    let Some(backprop_fn) = inner.backprop_fn else {
        return;
    };
    debug_assert_eq!(backprop_fn.n_operands(), inner.children.len());
    // read every operand before writing, `x * x` has the same node twice
    let operands: Vec<f32> = inner.children.iter().map(|c| c.borrow().data).collect();
    let local = backprop_fn.local_grads(&operands, inner.data);
    for (child, d) in inner.children.iter().zip(local) {
        child.borrow_mut().grad += d * inner.grad;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_counts() {
        assert_eq!(BackpropFunc::Div.n_operands(), 2);
        assert_eq!(BackpropFunc::Sigmoid.n_operands(), 1);
    }

    #[test]
    fn test_local_grads_use_output_where_cheaper() {
        // tanh and sigmoid derivatives are written in terms of the forward result
        let t = 0.3f32.tanh();
        assert_eq!(BackpropFunc::Tanh.local_grads(&[0.3], t)[0], 1.0 - t * t);
        assert_eq!(BackpropFunc::Exp.local_grads(&[2.0], 2.0f32.exp())[0], 2.0f32.exp());
        assert_eq!(BackpropFunc::Sigmoid.local_grads(&[0.0], 0.5)[0], 0.25);
    }

    #[test]
    fn test_kinks() {
        assert_eq!(BackpropFunc::ReLU.local_grads(&[0.0], 0.0), [0.0, 0.0]);
        assert_eq!(BackpropFunc::Abs.local_grads(&[0.0], 0.0), [0.0, 0.0]);
        assert_eq!(BackpropFunc::Abs.local_grads(&[-4.0], 4.0), [-1.0, 0.0]);
    }
}
