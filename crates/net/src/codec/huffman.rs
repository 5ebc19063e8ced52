use crate::error::PacketError;

pub const MAX_SYMBOLS: usize = 257;
const EOF_SYMBOL: usize = 256;
const MAX_NODES: usize = MAX_SYMBOLS * 2 - 1;
const LUT_BITS: u32 = 10;
const LUT_SIZE: usize = 1 << LUT_BITS;
const LUT_MASK: u64 = LUT_SIZE as u64 - 1;
const NO_LEAF: u16 = u16::MAX;

/// Byte frequencies the tree is built from, plus a trailing entry for the
/// EOF symbol whose weight is fixed to 1. Both ends must agree on them.
pub const FREQUENCY_TABLE: [u32; MAX_SYMBOLS] = [
    1 << 30, 4545, 2657, 431, 1950, 919, 444, 482, 2244, 617, 838, 542, 715, 1814, 304, 240, 754,
    212, 647, 186, 283, 131, 146, 166, 543, 164, 167, 136, 179, 859, 363, 113, 157, 154, 204, 108,
    137, 180, 202, 176, 872, 404, 168, 134, 151, 111, 113, 109, 120, 126, 129, 100, 41, 20, 16,
    22, 18, 18, 17, 19, 16, 37, 13, 21, 362, 166, 99, 78, 95, 88, 81, 70, 83, 284, 91, 187, 77, 68,
    52, 68, 59, 66, 61, 638, 71, 157, 50, 46, 69, 43, 11, 24, 13, 19, 10, 12, 12, 20, 14, 9, 20,
    20, 10, 10, 15, 15, 12, 12, 7, 19, 15, 14, 13, 18, 35, 19, 17, 14, 8, 5, 15, 17, 9, 15, 14, 18,
    8, 10, 2173, 134, 157, 68, 188, 60, 170, 60, 194, 62, 175, 71, 148, 67, 167, 78, 211, 67, 156,
    69, 1674, 90, 174, 53, 147, 89, 181, 51, 174, 63, 163, 80, 167, 94, 128, 122, 223, 153, 218,
    77, 200, 110, 190, 73, 174, 69, 145, 66, 277, 143, 141, 60, 136, 53, 180, 57, 142, 57, 158,
    61, 166, 112, 152, 92, 26, 22, 21, 28, 20, 26, 30, 21, 32, 27, 20, 17, 23, 21, 30, 22, 22, 21,
    27, 25, 17, 27, 23, 18, 39, 26, 15, 21, 12, 18, 18, 27, 20, 18, 15, 19, 11, 17, 33, 12, 18, 15,
    19, 18, 16, 26, 17, 18, 9, 10, 25, 22, 22, 17, 20, 16, 6, 16, 15, 20, 14, 18, 24, 335, 1517,
];

#[derive(Debug, Clone, Copy)]
struct Node {
    bits: u32,
    num_bits: u32,
    leaves: [u16; 2],
}

impl Node {
    fn is_symbol(&self) -> bool {
        self.num_bits != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct ConstructNode {
    id: u16,
    frequency: u64,
}

/// Static Huffman coder. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct Huffman {
    nodes: Vec<Node>,
    start: usize,
    decode_lut: Vec<u16>,
}

impl Default for Huffman {
    fn default() -> Self {
        Self::new(&FREQUENCY_TABLE)
    }
}

impl Huffman {
    pub fn new(frequencies: &[u32; MAX_SYMBOLS]) -> Self {
        let mut huffman = Self {
            nodes: Vec::with_capacity(MAX_NODES),
            start: 0,
            decode_lut: vec![0; LUT_SIZE],
        };
        huffman.construct_tree(frequencies);
        huffman.build_lut();
        huffman
    }

    fn construct_tree(&mut self, frequencies: &[u32; MAX_SYMBOLS]) {
        let mut left: Vec<ConstructNode> = (0..MAX_SYMBOLS)
            .map(|i| {
                self.nodes.push(Node {
                    bits: 0,
                    num_bits: u32::MAX,
                    leaves: [NO_LEAF; 2],
                });
                ConstructNode {
                    id: i as u16,
                    frequency: if i == EOF_SYMBOL { 1 } else { frequencies[i] as u64 },
                }
            })
            .collect();

        while left.len() > 1 {
            // stable, so equal frequencies keep their insertion order
            left.sort_by(|a, b| b.frequency.cmp(&a.frequency));

            let Some(last) = left.pop() else { break };
            let Some(second) = left.last_mut() else { break };
            let id = self.nodes.len() as u16;
            self.nodes.push(Node {
                bits: 0,
                num_bits: 0,
                leaves: [last.id, second.id],
            });
            second.id = id;
            second.frequency += last.frequency;
        }

        self.start = self.nodes.len() - 1;
        self.assign_bits(self.start, 0, 0);
    }

    fn assign_bits(&mut self, node: usize, bits: u32, depth: u32) {
        let [zero, one] = self.nodes[node].leaves;
        if one != NO_LEAF {
            self.assign_bits(one as usize, bits | (1 << depth), depth + 1);
        }
        if zero != NO_LEAF {
            self.assign_bits(zero as usize, bits, depth + 1);
        }
        if self.nodes[node].is_symbol() {
            self.nodes[node].bits = bits;
            self.nodes[node].num_bits = depth;
        }
    }

    fn build_lut(&mut self) {
        for i in 0..LUT_SIZE {
            let mut bits = i;
            let mut node = self.start;
            for _ in 0..LUT_BITS {
                node = self.nodes[node].leaves[bits & 1] as usize;
                bits >>= 1;
                if self.nodes[node].is_symbol() {
                    break;
                }
            }
            self.decode_lut[i] = node as u16;
        }
    }

    /// Compresses `input`, failing if the result would need `max_output`
    /// bytes or more.
    pub fn compress(&self, input: &[u8], max_output: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(max_output.min(input.len() + 8));
        let mut bits: u64 = 0;
        let mut bitcount: u32 = 0;

        let symbols = input
            .iter()
            .map(|&b| b as usize)
            .chain(std::iter::once(EOF_SYMBOL));
        for symbol in symbols {
            let node = &self.nodes[symbol];
            bits |= (node.bits as u64) << bitcount;
            bitcount += node.num_bits;
            while bitcount >= 8 {
                out.push((bits & 0xff) as u8);
                if out.len() >= max_output {
                    return None;
                }
                bits >>= 8;
                bitcount -= 8;
            }
        }
        out.push((bits & 0xff) as u8);
        Some(out)
    }

    pub fn decompress(&self, input: &[u8], max_output: usize) -> Result<Vec<u8>, PacketError> {
        let mut out = Vec::with_capacity(max_output.min(input.len() * 4));
        let mut src = input.iter();
        let mut bits: u64 = 0;
        let mut bitcount: u32 = 0;

        loop {
            let mut node = None;
            if bitcount >= LUT_BITS {
                node = Some(self.decode_lut[(bits & LUT_MASK) as usize] as usize);
            }

            while bitcount < 24 {
                let Some(&byte) = src.next() else { break };
                bits |= (byte as u64) << bitcount;
                bitcount += 8;
            }

            let mut node = node.unwrap_or(self.decode_lut[(bits & LUT_MASK) as usize] as usize);

            if self.nodes[node].is_symbol() {
                let used = self.nodes[node].num_bits;
                bitcount = bitcount
                    .checked_sub(used)
                    .ok_or(PacketError::Decompression)?;
                bits >>= used;
            } else {
                bitcount = bitcount
                    .checked_sub(LUT_BITS)
                    .ok_or(PacketError::Decompression)?;
                bits >>= LUT_BITS;
                loop {
                    node = self.nodes[node].leaves[(bits & 1) as usize] as usize;
                    bitcount = bitcount.checked_sub(1).ok_or(PacketError::Decompression)?;
                    bits >>= 1;
                    if self.nodes[node].is_symbol() {
                        break;
                    }
                    if bitcount == 0 {
                        return Err(PacketError::Decompression);
                    }
                }
            }

            if node == EOF_SYMBOL {
                break;
            }
            if out.len() >= max_output {
                return Err(PacketError::Decompression);
            }
            out.push(node as u8);
        }

        Ok(out)
    }
}
