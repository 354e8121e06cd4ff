use tracescan_protocol::{CHANNELS, CHANNEL_BASES};

const DNA_BITMASK_A: u8 = 1;
const DNA_BITMASK_C: u8 = 2;
const DNA_BITMASK_G: u8 = 4;
const DNA_BITMASK_T: u8 = 8;
const DNA_BITMASK_N: u8 = DNA_BITMASK_A | DNA_BITMASK_C | DNA_BITMASK_G | DNA_BITMASK_T;

/// A bitmasked IUPAC code for DNA bases, bit `c` set for channel `c`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IupacCode(u8);

impl IupacCode {
    pub fn new(bitmask: u8) -> Self {
        Self(bitmask & DNA_BITMASK_N)
    }

    #[inline(always)]
    pub fn from_channel(channel: usize) -> Self {
        debug_assert!(channel < CHANNELS);
        Self(1 << channel)
    }

    pub fn from_channels(channels: &[usize]) -> Self {
        channels
            .iter()
            .fold(Self(0), |acc, &c| acc.union(Self::from_channel(c)))
    }

    #[inline(always)]
    pub fn from_letter(letter: char) -> Self {
        match letter.to_ascii_uppercase() {
            'A' => Self(DNA_BITMASK_A),
            'C' => Self(DNA_BITMASK_C),
            'G' => Self(DNA_BITMASK_G),
            'T' | 'U' => Self(DNA_BITMASK_T),
            'W' => Self(DNA_BITMASK_A | DNA_BITMASK_T),
            'S' => Self(DNA_BITMASK_C | DNA_BITMASK_G),
            'M' => Self(DNA_BITMASK_A | DNA_BITMASK_C),
            'K' => Self(DNA_BITMASK_G | DNA_BITMASK_T),
            'R' => Self(DNA_BITMASK_A | DNA_BITMASK_G),
            'Y' => Self(DNA_BITMASK_C | DNA_BITMASK_T),
            'B' => Self(DNA_BITMASK_C | DNA_BITMASK_G | DNA_BITMASK_T),
            'D' => Self(DNA_BITMASK_A | DNA_BITMASK_G | DNA_BITMASK_T),
            'H' => Self(DNA_BITMASK_A | DNA_BITMASK_C | DNA_BITMASK_T),
            'V' => Self(DNA_BITMASK_A | DNA_BITMASK_C | DNA_BITMASK_G),
            'N' => Self(DNA_BITMASK_N),
            _ => Self(0),
        }
    }

    /// Upper case letter for the set; `'-'` for the empty set.
    pub fn letter(&self) -> char {
        match self.0 {
            DNA_BITMASK_A => 'A',
            DNA_BITMASK_C => 'C',
            DNA_BITMASK_G => 'G',
            DNA_BITMASK_T => 'T',
            0b1001 => 'W',
            0b0110 => 'S',
            0b0011 => 'M',
            0b1100 => 'K',
            0b0101 => 'R',
            0b1010 => 'Y',
            0b1110 => 'B',
            0b1101 => 'D',
            0b1011 => 'H',
            0b0111 => 'V',
            DNA_BITMASK_N => 'N',
            _ => '-',
        }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn subset(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline(always)]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Same set on the opposite strand: A and T swap, C and G swap.
    pub fn complement(self) -> Self {
        let swap = |from: u8, to: u8| if self.0 & from != 0 { to } else { 0 };
        Self(
            swap(DNA_BITMASK_A, DNA_BITMASK_T)
                | swap(DNA_BITMASK_T, DNA_BITMASK_A)
                | swap(DNA_BITMASK_C, DNA_BITMASK_G)
                | swap(DNA_BITMASK_G, DNA_BITMASK_C),
        )
    }

    pub fn channels(&self) -> Vec<usize> {
        (0..CHANNELS).filter(|c| self.0 & (1 << c) != 0).collect()
    }

    #[inline(always)]
    pub fn to_vec(&self) -> Vec<char> {
        self.channels().into_iter().map(|c| CHANNEL_BASES[c]).collect()
    }
}

/// Two-base ambiguity letter for a heterozygote at channels `a` and `b`.
pub fn ambiguity_letter(a: usize, b: usize) -> char {
    IupacCode::from_channels(&[a, b]).letter()
}
