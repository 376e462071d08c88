//! Lazy product expressions.
//!
//! `&a * &x` builds a [`Product`] without running anything; handing it to a
//! vector runs the multiply. Rust's assignment operators cannot await, so
//! the sinks are named methods: [`Vector::assign`], [`Vector::accumulate`]
//! and [`Vector::subtract`].

use std::ops::{Add, Mul, Sub};

use spmv_core::Scalar;

use crate::ccsr::ClusteredMatrix;
use crate::error::Result;
use crate::matrix::SparseMatrix;
use crate::vector::Vector;

enum ProductSource<'a, T: Scalar> {
    Distributed(&'a SparseMatrix<T>),
    Clustered(&'a ClusteredMatrix<T>),
}

/// An unevaluated matrix-vector product.
pub struct Product<'a, T: Scalar> {
    source: ProductSource<'a, T>,
    x: &'a Vector<T>,
}

impl<T: Scalar> Product<'_, T> {
    async fn apply(&self, y: &mut Vector<T>, alpha: T, append: bool) -> Result<()> {
        match self.source {
            ProductSource::Distributed(matrix) => matrix.mul(self.x, y, alpha, append).await,
            ProductSource::Clustered(matrix) => matrix.mul(self.x, y, alpha, append),
        }
    }
}

impl<'a, T: Scalar> Mul<&'a Vector<T>> for &'a SparseMatrix<T> {
    type Output = Product<'a, T>;

    fn mul(self, x: &'a Vector<T>) -> Product<'a, T> {
        Product {
            source: ProductSource::Distributed(self),
            x,
        }
    }
}

impl<'a, T: Scalar> Mul<&'a Vector<T>> for &'a ClusteredMatrix<T> {
    type Output = Product<'a, T>;

    fn mul(self, x: &'a Vector<T>) -> Product<'a, T> {
        Product {
            source: ProductSource::Clustered(self),
            x,
        }
    }
}

/// A vector plus or minus a product, evaluated as a copy and one appending
/// multiply.
pub struct ProductSum<'a, T: Scalar> {
    base: &'a Vector<T>,
    product: Product<'a, T>,
    sign: T,
}

impl<'a, T: Scalar> Add<Product<'a, T>> for &'a Vector<T> {
    type Output = ProductSum<'a, T>;

    fn add(self, product: Product<'a, T>) -> ProductSum<'a, T> {
        ProductSum {
            base: self,
            product,
            sign: T::one(),
        }
    }
}

impl<'a, T: Scalar> Sub<Product<'a, T>> for &'a Vector<T> {
    type Output = ProductSum<'a, T>;

    fn sub(self, product: Product<'a, T>) -> ProductSum<'a, T> {
        ProductSum {
            base: self,
            product,
            sign: -T::one(),
        }
    }
}

impl<'a, T: Scalar> Add<&'a Vector<T>> for Product<'a, T> {
    type Output = ProductSum<'a, T>;

    fn add(self, base: &'a Vector<T>) -> ProductSum<'a, T> {
        ProductSum {
            base,
            product: self,
            sign: T::one(),
        }
    }
}

/// Expressions a vector can be assigned from.
#[allow(async_fn_in_trait)]
pub trait VectorExpr<T: Scalar> {
    async fn eval_into(self, y: &mut Vector<T>) -> Result<()>;
}

impl<T: Scalar> VectorExpr<T> for Product<'_, T> {
    async fn eval_into(self, y: &mut Vector<T>) -> Result<()> {
        self.apply(y, T::one(), false).await
    }
}

impl<T: Scalar> VectorExpr<T> for ProductSum<'_, T> {
    async fn eval_into(self, y: &mut Vector<T>) -> Result<()> {
        y.copy_from(self.base)?;
        self.product.apply(y, self.sign, true).await
    }
}

impl<T: Scalar> Vector<T> {
    /// `y = expr`, e.g. `y.assign(&a * &x)` or `y.assign(&b - &a * &x)`.
    pub async fn assign(&mut self, expr: impl VectorExpr<T>) -> Result<()> {
        expr.eval_into(self).await
    }

    /// `y += A * x`.
    pub async fn accumulate(&mut self, product: Product<'_, T>) -> Result<()> {
        product.apply(self, T::one(), true).await
    }

    /// `y -= A * x`.
    pub async fn subtract(&mut self, product: Product<'_, T>) -> Result<()> {
        product.apply(self, -T::one(), true).await
    }
}
