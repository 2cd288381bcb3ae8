// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use argus_server::argus_server::server_main;

fn main() {
    server_main(
        "Argus",
        "Copyright (c) 2025 Steven Rosenthal smr@dt3.org.\n\
         Licensed for non-commercial use.");
}
