mod support;

mod admission;
