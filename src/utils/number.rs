pub fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

pub fn floor_div(a: usize, b: usize) -> usize {
    a / b
}
