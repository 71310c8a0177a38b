//! Scalar values which form a computation graph
use std::{
    cell::RefCell,
    collections::HashSet,
    iter::Sum,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::backprop_fns::{BackpropFunc, propagate};

type SharedValue = Rc<RefCell<InnerValue>>;

/// Newtype representing a shared value in a computation graph
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a new value, not derived from any other values
    pub fn new(data: f32) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(data, None, vec![]))))
    }

    /// Create a node computed from `operands` by `backprop_fn`
    fn derived(data: f32, backprop_fn: BackpropFunc, operands: &[&Value]) -> Self {
        let children = operands.iter().map(|v| v.0.clone()).collect();
        Self(Rc::new(RefCell::new(InnerValue::new(
            data,
            Some(backprop_fn),
            children,
        ))))
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    pub fn grad(&self) -> f32 {
        self.0.borrow().grad
    }

    fn id(&self) -> u64 {
        self.0.borrow().id
    }

    // &mut is not required by the RefCell, it marks the value as exclusively mutated
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    /// Zeros the gradient of this node and of every node it was derived from.
    /// Parameters are leaves, so for them this is a single write.
    pub fn zero_grad(&mut self) {
        if self.0.borrow().children.is_empty() {
            self.0.borrow_mut().grad = 0.0;
            return;
        }
        for node in self.topological_order() {
            node.0.borrow_mut().grad = 0.0;
        }
    }

    /// Accumulates `d self / d node` into the gradient of every node `self` depends on
    pub fn backward(&self) {
        self.0.borrow_mut().grad = 1.0;
        for node in self.topological_order().iter().rev() {
            propagate(node);
        }
    }

    /// Every node reachable from `self`, each one placed after all of its operands.
    /// Walks the graph with an explicit stack so deep graphs do not exhaust the call stack.
    fn topological_order(&self) -> Vec<Value> {
        let mut order = Vec::new();
        let mut visited: HashSet<u64> = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((node, operands_done)) = stack.pop() {
            if operands_done {
                order.push(node);
                continue;
            }
            if !visited.insert(node.id()) {
                continue;
            }
            stack.push((node.clone(), true));
            for child in node.0.borrow().children.iter() {
                if !visited.contains(&child.borrow().id) {
                    stack.push((Value(child.clone()), false));
                }
            }
        }
        order
    }
}

// Elementwise functions
impl Value {
    pub fn relu(&self) -> Value {
        self.unary(self.data().max(0.0), BackpropFunc::ReLU)
    }

    pub fn exp(&self) -> Value {
        self.unary(self.data().exp(), BackpropFunc::Exp)
    }

    /// Natural logarithm, the caller is responsible for keeping the input positive
    pub fn ln(&self) -> Value {
        self.unary(self.data().ln(), BackpropFunc::Ln)
    }

    pub fn tanh(&self) -> Value {
        self.unary(self.data().tanh(), BackpropFunc::Tanh)
    }

    pub fn sigmoid(&self) -> Value {
        self.unary(sigmoid(self.data()), BackpropFunc::Sigmoid)
    }

    pub fn abs(&self) -> Value {
        self.unary(self.data().abs(), BackpropFunc::Abs)
    }

    fn unary(&self, data: f32, backprop_fn: BackpropFunc) -> Value {
        Value::derived(data, backprop_fn, &[self])
    }
}

/// Logistic function on plain floats, split by sign so that `exp` never overflows
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Implements a binary operator for `&Value` and, by delegation, for owned `Value`
macro_rules! impl_binary_op(
    ($trait:ident, $method:ident, $op:tt, $backprop_fn:expr) => {
        impl $trait for &Value {
            type Output = Value;

            fn $method(self, other: &Value) -> Value {
                Value::derived(self.data() $op other.data(), $backprop_fn, &[self, other])
            }
        }

        impl $trait for Value {
            type Output = Value;

            fn $method(self, other: Value) -> Value {
                &self $op &other
            }
        }
    }
);
impl_binary_op!(Add, add, +, BackpropFunc::Add);
impl_binary_op!(Sub, sub, -, BackpropFunc::Sub);
impl_binary_op!(Mul, mul, *, BackpropFunc::Mul);
impl_binary_op!(Div, div, /, BackpropFunc::Div);

impl Neg for &Value {
    type Output = Value;

    fn neg(self) -> Value {
        self.unary(-self.data(), BackpropFunc::Neg)
    }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.reduce(|acc, v| acc + v).unwrap_or_else(|| Value::new(0.0))
    }
}

/// Values compare by their current data, not by identity
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

impl Eq for Value {}

// lets the losses take both `&[Value]` and `&[&Value]`
impl AsRef<Value> for Value {
    fn as_ref(&self) -> &Value {
        self
    }
}

#[derive(Debug)]
pub(crate) struct InnerValue {
    pub(crate) data: f32,
    /// gradient of the graph output with respect to this value
    pub(crate) grad: f32,
    /// Operands of the forward operation, in order
    pub(crate) children: Vec<SharedValue>,
    id: u64,
    /// `None` for leaves
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerValue {
    fn new(data: f32, backprop_fn: Option<BackpropFunc>, children: Vec<SharedValue>) -> Self {
        Self {
            data,
            grad: 0.0,
            children,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            backprop_fn,
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
pub mod tests {
    use super::*;

    #[macro_export]
    macro_rules! assert_eq_float {
        ($a:expr, $b:expr) => {
            assert!((($a) - ($b)).abs() < 1e-6);
        };
    }

    /// Central difference of `f` at `x`
    fn numeric_grad(f: impl Fn(&Value) -> Value, x: f32) -> f32 {
        let h = 1e-2;
        (f(&Value::new(x + h)).data() - f(&Value::new(x - h)).data()) / (2.0 * h)
    }

    fn check_unary(f: impl Fn(&Value) -> Value, x: f32) {
        let a = Value::new(x);
        f(&a).backward();
        let expected = numeric_grad(&f, x);
        assert!(
            (a.grad() - expected).abs() < 1e-2 * (1.0 + expected.abs()),
            "x = {}: autograd {} vs numeric {}",
            x,
            a.grad(),
            expected
        );
    }

    #[test]
    fn test_arithmetic_gradients() {
        // d = (a + b) * c - a / b
        let a = Value::new(2.0);
        let b = Value::new(4.0);
        let c = Value::new(-1.0);
        let d = &(&(&a + &b) * &c) - &(&a / &b);
        assert_eq_float!(d.data(), -6.5);

        d.backward();
        assert_eq_float!(a.grad(), -1.0 - 1.0 / 4.0);
        assert_eq_float!(b.grad(), -1.0 + 2.0 / 16.0);
        assert_eq_float!(c.grad(), 6.0);
        assert_eq_float!(d.grad(), 1.0);
    }

    #[test]
    fn test_owned_operators() {
        let a = Value::new(3.0);
        let b = Value::new(0.5);
        let c = a.clone() * b.clone() + Value::new(1.0);
        assert_eq_float!(c.data(), 2.5);
        c.backward();
        assert_eq_float!(a.grad(), 0.5);
        assert_eq_float!((-&b).data(), -0.5);
    }

    #[test]
    fn test_reused_operand_accumulates() {
        // y = x * x + x, reached twice directly and once through the square
        let x = Value::new(3.0);
        let y = &(&x * &x) + &x;
        y.backward();
        assert_eq_float!(x.grad(), 7.0);
    }

    #[test]
    fn test_unary_gradients_match_finite_differences() {
        for x in [-1.7, -0.4, 0.3, 1.9] {
            check_unary(Value::exp, x);
            check_unary(Value::tanh, x);
            check_unary(Value::sigmoid, x);
            check_unary(Value::abs, x);
            check_unary(Value::relu, x);
            check_unary(|v| -v, x);
        }
        for x in [0.2, 1.0, 5.0] {
            check_unary(Value::ln, x);
        }
    }

    #[test]
    fn test_sigmoid_is_stable() {
        assert_eq!(sigmoid(-200.0), 0.0);
        assert_eq!(sigmoid(200.0), 1.0);
        assert_eq_float!(sigmoid(0.0), 0.5);
    }

    #[test]
    fn test_sum() {
        let xs: Vec<Value> = (1..=4).map(|i| Value::new(i as f32)).collect();
        let total: Value = xs.iter().cloned().sum();
        assert_eq_float!(total.data(), 10.0);
        total.backward();
        assert!(xs.iter().all(|x| x.grad() == 1.0));
        let empty: Value = std::iter::empty().sum();
        assert_eq!(empty.data(), 0.0);
    }

    #[test]
    fn test_backward_accumulates_until_zeroed() {
        let a = Value::new(2.0);
        let b = Value::new(3.0);
        let mut c = &a * &b;
        c.backward();
        c.backward();
        // gradients of leaves add up across passes
        assert_eq_float!(a.grad(), 6.0);

        c.zero_grad();
        assert_eq!(a.grad(), 0.0);
        assert_eq!(b.grad(), 0.0);
        assert_eq!(c.grad(), 0.0);
    }

    #[test]
    fn test_set_data_keeps_identity() {
        let mut w = Value::new(1.0);
        let shared = w.clone();
        w.set_data(-2.5);
        assert_eq!(shared.data(), -2.5);
    }
}
