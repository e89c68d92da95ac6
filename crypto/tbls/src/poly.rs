//! Secret sharing polynomials and Lagrange interpolation at zero.

use crate::FromRandom;
use ff::Field;
use rand::RngCore;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Mul, MulAssign};

/// A polynomial with coefficients in `G`, evaluated over scalars `S`. The
/// constant coefficient is the shared secret; evaluations at non-zero points
/// are the dealt shares.
#[derive(Debug)]
pub struct Poly<G, S>
where
    G: Debug,
{
    coefficients: Vec<G>,
    _scalar: PhantomData<S>,
}

impl<G, S> Poly<G, S>
where
    G: Debug + MulAssign<S> + AddAssign<G> + FromRandom + Copy,
    S: Copy,
{
    pub fn random(degree: usize, rng: &mut impl RngCore) -> Self {
        let coefficients = (0..=degree).map(|_| G::from_random(rng)).collect();
        Poly {
            coefficients,
            _scalar: PhantomData,
        }
    }

    /// Horner evaluation at `x`
    pub fn evaluate(&self, x: impl Into<S>) -> G {
        let x: S = x.into();
        let mut coefficients = self.coefficients.iter().rev();
        let mut result = *coefficients.next().expect("polynomial has no coefficients");
        for &coefficient in coefficients {
            result.mul_assign(x);
            result.add_assign(coefficient);
        }
        result
    }
}

/// Interpolates the constant coefficient of the polynomial running through
/// `points`.
///
/// # Panics
/// If `points` is empty or contains a duplicate x coordinate.
pub fn interpolate_zero<G, S>(points: &[(S, G)]) -> G
where
    G: Copy + Mul<S, Output = G> + Add<G, Output = G>,
    S: Copy + Field,
{
    let mut constant: Option<G> = None;

    for (i, &(xi, yi)) in points.iter().enumerate() {
        let mut lagrange_coefficient = S::ONE;
        for (j, &(xj, _)) in points.iter().enumerate() {
            if i != j {
                lagrange_coefficient *= -xj * (xi - xj).invert().expect("distinct x coordinates");
            }
        }

        let term = yi * lagrange_coefficient;
        constant = Some(match constant {
            Some(sum) => sum + term,
            None => term,
        });
    }

    constant.expect("points may not be empty")
}
