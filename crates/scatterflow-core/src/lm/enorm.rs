//! Scaled Euclidean norm (MINPACK `enorm`): sums squares in three separate
//! accumulators bucketed by magnitude so that neither overflow nor
//! underflow corrupts the result for vectors with widely-scaled entries.

use nalgebra::DVector;

const RDWARF: f64 = 3.834e-20;
const RGIANT: f64 = 1.304e19;

/// `sqrt(sum(v_i^2))`, computed to avoid overflow/underflow on extreme inputs.
pub fn enorm(v: &DVector<f64>) -> f64 {
    let n = v.len();
    if n == 0 {
        return 0.0;
    }

    let mut s1 = 0.0; // sum of squares of components > rdwarf and <= agiant (large)
    let mut s2 = 0.0; // intermediate-magnitude components, no scaling needed
    let mut s3 = 0.0; // small components, scaled by rdwarf
    let mut x1max = 0.0_f64;
    let mut x3max = 0.0_f64;
    let agiant = RGIANT / n as f64;

    for &xi in v.iter() {
        let xabs = xi.abs();
        if xabs > RDWARF && xabs < agiant {
            s2 += xabs * xabs;
        } else if xabs <= RDWARF {
            if xabs > x3max {
                s3 = 1.0 + s3 * (x3max / xabs).powi(2);
                x3max = xabs;
            } else if xabs != 0.0 {
                s3 += (xabs / x3max).powi(2);
            }
        } else if xabs > x1max {
            s1 = 1.0 + s1 * (x1max / xabs).powi(2);
            x1max = xabs;
        } else {
            s1 += (xabs / x1max).powi(2);
        }
    }

    if s1 != 0.0 {
        x1max * (s1 + (s2 / x1max) / x1max).sqrt()
    } else if s2 != 0.0 {
        if s2 >= x3max {
            (s2 * (1.0 + (x3max / s2) * (x3max * s3))).sqrt()
        } else {
            (x3max * ((s2 / x3max) + (x3max * s3))).sqrt()
        }
    } else {
        x3max * s3.sqrt()
    }
}
