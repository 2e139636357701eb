use burn::tensor::{PrintOptions, set_print_options};
use num::Float;

#[macro_export]
macro_rules! check_nan {
    ($a:expr, $b:expr, $c: expr) => {{
        use burn::tensor::cast::ToElement;
        if $a.clone().is_nan().int().sum().into_scalar().to_i32() > 0 {
            println!("A = {}", $a);
            println!("B = {}", $b);
            println!("C = {}", $c);
            panic!("found nan in line {}", line!());
        }
    }};
}

#[macro_export]
macro_rules! check_nan_1 {
    ($a:expr) => {{
        use burn::tensor::cast::ToElement;
        if $a.clone().is_nan().int().sum().into_scalar().to_i32() > 0 {
            println!("A = {}", $a);
            panic!("found nan in line {}", line!());
        };
    }};
}

pub fn set_tensor_dbg_precision(prec: usize) {
    let po = PrintOptions {
        precision: Option::Some(prec),
        edge_items: 10,
        ..Default::default()
    };

    set_print_options(po);
}

// Helper function for comparing floats
pub fn assert_approx_eq<F>(a: &F, b: &F, epsilon: F)
where
    F: Float + std::fmt::Display + std::fmt::Debug,
{
    assert!(
        (*a - *b).abs() <= epsilon,
        "Values differ: {:?} vs {:?} (tolerance: {:?})",
        *a,
        *b,
        epsilon
    );
}
