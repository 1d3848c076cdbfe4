#![macro_use]
#![allow(unused)]

// Generates the level macros in one go: with `defmt` enabled each level
// forwards to the defmt macro of the same name, otherwise the arguments are
// evaluated and discarded. `$dol` carries a literal `$` into the generated
// rules.
macro_rules! level_macros {
    ($dol:tt $($level:ident)*) => {
        $(
            #[allow(unused_macros)]
            #[collapse_debuginfo(yes)]
            macro_rules! $level {
                ($dol s:literal $dol(, $dol x:expr)* $dol(,)?) => {
                    {
                        #[cfg(feature = "defmt")]
                        ::defmt::$level!($dol s $dol(, $dol x)*);
                        #[cfg(not(feature = "defmt"))]
                        let _ = ($dol( & $dol x ),*);
                    }
                };
            }
        )*
    };
}

level_macros!($ trace debug info warn error);
