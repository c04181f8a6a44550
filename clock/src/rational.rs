// Best rational approximation of a real value, via continued fraction
// convergents and semiconvergents:
//
//     value ~= a + b/c     (where c <= max_denominator)
//
// The result ends up in hardware divider registers, so the search order and
// the tie-breaking (first strictly better candidate wins) must stay as is.

const EPSILON: f64 = 1e-5;
const MAX_ITERATIONS: usize = 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rational {
    pub integer: u32,
    pub numerator: u32,
    pub denominator: u32,
}

impl Rational {
    pub fn value(&self) -> f64 {
        self.integer as f64 + self.numerator as f64 / self.denominator as f64
    }
}

pub fn rational_approximation(value: f64, max_denominator: u32) -> Rational {
    let f0 = value.fract();
    let mut best = Rational {
        integer: value.trunc() as u32,
        numerator: 0,
        denominator: 1,
    };

    let mut f = f0;
    let mut delta = f0;

    // The fractional part has a_0 = 0, hence the seeds.
    let mut h: [u64; 2] = [1, 0];
    let mut k: [u64; 2] = [0, 1];
    let max_denominator = u64::from(max_denominator);

    for _ in 0..MAX_ITERATIONS {
        if f <= EPSILON {
            break;
        }

        let inverse = 1.0 / f;
        f = inverse.fract();
        let an = inverse.trunc() as u64;

        for m in (an + 1) / 2..=an {
            let hm = m * h[1] + h[0];
            let km = m * k[1] + k[0];
            if km > max_denominator {
                break;
            }
            let d = (hm as f64 / km as f64 - f0).abs();
            if d < delta {
                delta = d;
                best.numerator = hm as u32;
                best.denominator = km as u32;
            }
        }

        let hn = an * h[1] + h[0];
        let kn = an * k[1] + k[0];
        h = [h[1], hn];
        k = [k[1], kn];

        // Every later candidate has a larger denominator than this one.
        if kn > max_denominator {
            break;
        }
    }

    best
}
